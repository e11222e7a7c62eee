use crate::common::TableName;
use crate::table_manager::TableManager;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

// -----------------------------------------------------------------------------------------------
//  SystemTable
// -----------------------------------------------------------------------------------------------

/// The cluster-wide catalog of which Table Manager coordinates each table.
pub trait SystemTable: Send + Sync {
  fn lookup(&self, table: &TableName) -> Option<Arc<TableManager>>;

  /// Records `manager` as the coordinator of its table. Returns false if a live coordinator
  /// is already registered for that table name.
  fn register(&self, manager: Arc<TableManager>) -> bool;

  fn remove(&self, table: &TableName) -> Option<Arc<TableManager>>;

  fn tables(&self) -> Vec<TableName>;
}

#[derive(Debug, Default)]
pub struct InMemorySystemTable {
  managers: Mutex<BTreeMap<TableName, Arc<TableManager>>>,
}

impl InMemorySystemTable {
  pub fn new() -> InMemorySystemTable {
    InMemorySystemTable { managers: Mutex::new(BTreeMap::new()) }
  }
}

impl SystemTable for InMemorySystemTable {
  fn lookup(&self, table: &TableName) -> Option<Arc<TableManager>> {
    self.managers.lock().unwrap_or_else(PoisonError::into_inner).get(table).cloned()
  }

  fn register(&self, manager: Arc<TableManager>) -> bool {
    let mut managers = self.managers.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = managers.get(manager.table()) {
      if existing.is_alive() && !Arc::ptr_eq(existing, &manager) {
        return false;
      }
    }
    managers.insert(manager.table().clone(), manager);
    true
  }

  fn remove(&self, table: &TableName) -> Option<Arc<TableManager>> {
    self.managers.lock().unwrap_or_else(PoisonError::into_inner).remove(table)
  }

  fn tables(&self) -> Vec<TableName> {
    self.managers.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn register_test() {
    let system_table = InMemorySystemTable::new();
    let t = TableName::new("PUBLIC", "T");
    let first = Arc::new(TableManager::new(t.clone(), None));
    assert!(system_table.register(first.clone()));
    // Registering the same coordinator again is fine, a second live one is not.
    assert!(system_table.register(first.clone()));
    assert!(!system_table.register(Arc::new(TableManager::new(t.clone(), None))));
    // Once the first is dead it can be replaced.
    first.shutdown();
    let second = Arc::new(TableManager::new(t.clone(), None));
    assert!(system_table.register(second.clone()));
    assert!(Arc::ptr_eq(&system_table.lookup(&t).unwrap(), &second));
    assert_eq!(system_table.tables(), vec![t.clone()]);
    assert!(system_table.remove(&t).is_some());
    assert!(system_table.lookup(&t).is_none());
  }
}
