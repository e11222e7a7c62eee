use crate::common::{SessionId, TableName};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

// -----------------------------------------------------------------------------------------------
//  LockEventLog
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEventKind {
  Acquired { exclusive: bool },
  Reentered,
  Waiting,
  Released,
  TimedOut,
  Deadlock(Vec<SessionId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
  pub session: SessionId,
  pub kind: LockEventKind,
}

/// The recent lock history of each table, kept for diagnosing lock waits. One log belongs to
/// one `Database`, so independent instances in the same process never see each other's
/// events.
#[derive(Debug)]
pub struct LockEventLog {
  capacity: usize,
  logs: Mutex<BTreeMap<TableName, VecDeque<LockEvent>>>,
}

impl LockEventLog {
  pub fn new(capacity: usize) -> LockEventLog {
    LockEventLog { capacity, logs: Mutex::new(BTreeMap::new()) }
  }

  pub fn record(&self, table: &TableName, session: SessionId, kind: LockEventKind) {
    if self.capacity == 0 {
      return;
    }
    let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
    let log = logs.entry(table.clone()).or_insert_with(VecDeque::new);
    if log.len() == self.capacity {
      log.pop_front();
    }
    log.push_back(LockEvent { session, kind });
  }

  /// Oldest first.
  pub fn events(&self, table: &TableName) -> Vec<LockEvent> {
    let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
    match logs.get(table) {
      Some(log) => log.iter().cloned().collect(),
      None => Vec::new(),
    }
  }

  /// Forgets a table, e.g. once it has been dropped.
  pub fn remove(&self, table: &TableName) {
    self.logs.lock().unwrap_or_else(PoisonError::into_inner).remove(table);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bounded_log_test() {
    let log = LockEventLog::new(2);
    let t = TableName::new("PUBLIC", "T");
    log.record(&t, SessionId(1), LockEventKind::Waiting);
    log.record(&t, SessionId(1), LockEventKind::Acquired { exclusive: true });
    log.record(&t, SessionId(1), LockEventKind::Released);
    let kinds: Vec<LockEventKind> = log.events(&t).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![LockEventKind::Acquired { exclusive: true }, LockEventKind::Released]);
    log.remove(&t);
    assert!(log.events(&t).is_empty());
  }

  #[test]
  fn separate_logs_test() {
    let (a, b) = (LockEventLog::new(4), LockEventLog::new(4));
    let t = TableName::new("PUBLIC", "T");
    a.record(&t, SessionId(1), LockEventKind::Waiting);
    assert_eq!(a.events(&t).len(), 1);
    assert!(b.events(&t).is_empty());
  }
}
