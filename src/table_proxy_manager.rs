use crate::common::{mk_rid, Clock, DatabaseUrl, TableName, TransactionName};
use crate::lock_manager::{Database, Session};
use crate::lock_type::{LockRequest, LockType, SessionDescriptor, StatementKind};
use crate::system_table::SystemTable;
use crate::table_manager::TableManager;
use crate::table_proxy::{ProxyError, ReplicaExecutor, TableProxy};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[cfg(test)]
#[path = "test/table_proxy_test.rs"]
mod table_proxy_test;

// -----------------------------------------------------------------------------------------------
//  TableProxyManager
// -----------------------------------------------------------------------------------------------

/// The distributed side of one session: it takes cluster-wide locks for the statements the
/// session runs, sends their updates to every replica, and gives the locks back when the
/// session commits or rolls back.
pub struct TableProxyManager<R: Rng> {
  local: DatabaseUrl,
  session: Session,
  transaction: TransactionName,
  system_table: Arc<dyn SystemTable>,
  executor: Arc<dyn ReplicaExecutor>,
  database: Arc<Database>,
  clock: Arc<dyn Clock>,
  rand: R,
  /// Distributed locks held by this session, kept until the transaction ends.
  proxies: BTreeMap<TableName, TableProxy>,
  /// Tables created and dropped by the current transaction.
  created: BTreeSet<TableName>,
  dropped: BTreeSet<TableName>,
}

impl<R: Rng> TableProxyManager<R> {
  pub fn new(
    local: DatabaseUrl,
    session: Session,
    system_table: Arc<dyn SystemTable>,
    executor: Arc<dyn ReplicaExecutor>,
    database: Arc<Database>,
    clock: Arc<dyn Clock>,
    rand: R,
  ) -> TableProxyManager<R> {
    let transaction = match &session.transaction {
      Some(transaction) => transaction.clone(),
      None => TransactionName(format!("{}/{}", local, session.id)),
    };
    TableProxyManager {
      local,
      session,
      transaction,
      system_table,
      executor,
      database,
      clock,
      rand,
      proxies: BTreeMap::new(),
      created: BTreeSet::new(),
      dropped: BTreeSet::new(),
    }
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn transaction(&self) -> &TransactionName {
    &self.transaction
  }

  pub fn proxy(&self, table: &TableName) -> Option<&TableProxy> {
    self.proxies.get(table)
  }

  fn descriptor(&self) -> SessionDescriptor {
    SessionDescriptor {
      database: self.local.clone(),
      session_id: self.session.id,
      auto_commit: self.session.auto_commit,
    }
  }

  /// Finds the coordinator a new grant on `table` must come from.
  fn resolve_manager(
    &self,
    kind: StatementKind,
    table: &TableName,
  ) -> Result<Arc<TableManager>, ProxyError> {
    if let Some(proxy) = self.proxies.get(table) {
      if kind == StatementKind::Create {
        return Err(ProxyError::TableExists(table.clone()));
      }
      return Ok(proxy.manager().clone());
    }
    let existing = self.system_table.lookup(table);
    match (kind, existing) {
      (StatementKind::Create, Some(manager)) if manager.is_alive() => {
        Err(ProxyError::TableExists(table.clone()))
      }
      (StatementKind::Create, _) => {
        debug!("{} starts a coordinator for new table {}", self.local, table);
        Ok(Arc::new(TableManager::new(table.clone(), Some(self.local.clone()))))
      }
      (_, None) => Err(ProxyError::UnknownTable(table.clone())),
      (_, Some(manager)) if !manager.is_alive() => {
        Err(ProxyError::CoordinatorUnavailable(table.clone()))
      }
      (_, Some(manager)) => Ok(manager),
    }
  }

  /// Asks `manager` for a `required` grant until it comes or the session lock timeout runs
  /// out.
  fn request_grant(
    &mut self,
    manager: Arc<TableManager>,
    required: LockType,
  ) -> Result<TableProxy, ProxyError> {
    let table = manager.table().clone();
    let deadline = Instant::now() + self.session.lock_timeout;
    let retry = self.database.config().deadlock_check;
    loop {
      let request =
        LockRequest::new(mk_rid(&mut self.rand), self.descriptor(), required, self.clock.now());
      let granted = manager.request_lock(&request);
      if granted != LockType::None {
        return Ok(TableProxy::new(manager, request, granted, self.local.clone()));
      }
      if !manager.is_alive() {
        return Err(ProxyError::CoordinatorUnavailable(table));
      }
      let now = Instant::now();
      if now >= deadline {
        info!("{} gave up waiting for a {:?} lock on {}", self.session.id, required, table);
        return Err(ProxyError::LockTimeout { table, requested: required });
      }
      thread::sleep(retry.min(deadline - now));
    }
  }

  /// Makes sure the session holds a distributed lock on `table` strong enough for `kind`. A
  /// lock already held is reused if it suffices and upgraded otherwise.
  pub fn acquire_locks(
    &mut self,
    kind: StatementKind,
    table: &TableName,
  ) -> Result<&TableProxy, ProxyError> {
    let required = kind.required_lock_type();
    let retained = self.proxies.get(table).map_or(false, |proxy| proxy.satisfies(required));
    if !retained || kind == StatementKind::Create {
      let manager = self.resolve_manager(kind, table)?;
      let proxy = self.request_grant(manager, required)?;
      self.proxies.insert(table.clone(), proxy);
    }
    Ok(&self.proxies[table])
  }

  /// Runs one statement on `table`: takes the distributed and local locks, then runs it on
  /// every replica of a regular table, or only on this instance for internal tables.
  ///
  /// A statement that fails gives back the distributed lock it was granted for itself, so
  /// that ending the statement commits nothing for it. A lock retained from an earlier
  /// statement of the transaction is kept.
  pub fn execute_statement(
    &mut self,
    kind: StatementKind,
    table: &TableName,
    sql: &str,
  ) -> Result<i64, ProxyError> {
    let retained = self.proxies.contains_key(table);
    self.acquire_locks(kind, table)?;
    match self.run_statement(kind, table, sql) {
      Ok(count) => {
        match kind {
          StatementKind::Create => {
            self.created.insert(table.clone());
          }
          StatementKind::Drop => {
            self.dropped.insert(table.clone());
          }
          _ => {}
        }
        Ok(count)
      }
      Err(error) => {
        if !retained {
          self.abort_grant(kind, table);
        }
        Err(error)
      }
    }
  }

  fn run_statement(
    &mut self,
    kind: StatementKind,
    table: &TableName,
    sql: &str,
  ) -> Result<i64, ProxyError> {
    let exclusive = kind.required_lock_type().is_exclusive();
    self.database.table_lock(table.clone()).lock(&self.session, exclusive, false)?;

    let executor = self.executor.clone();
    let proxy = match self.proxies.get_mut(table) {
      Some(proxy) => proxy,
      None => return Err(ProxyError::UnknownTable(table.clone())),
    };
    match kind {
      StatementKind::CreateReplica => {
        // The new copy is built here, then joins the replica set.
        let count = executor.execute(&self.local, sql, &self.transaction).map_err(|error| {
          ProxyError::AllReplicasFailed { table: table.clone(), failures: vec![error] }
        })?;
        proxy.add_replica(self.local.clone());
        Ok(count)
      }
      _ if !table.is_regular() => {
        executor.execute(&self.local, sql, &self.transaction).map_err(|error| {
          ProxyError::AllReplicasFailed { table: table.clone(), failures: vec![error] }
        })
      }
      StatementKind::Select => proxy.execute_query(&*executor, sql, &self.transaction),
      _ => proxy.execute_update(&*executor, sql, &self.transaction),
    }
  }

  /// Releases the grant a failed statement took, recording no update.
  fn abort_grant(&mut self, kind: StatementKind, table: &TableName) {
    if let Some(proxy) = self.proxies.remove(table) {
      let manager = proxy.manager().clone();
      proxy.release(false);
      debug!("{} gave back its {:?} lock on {}", self.session.id, kind, table);
      // A coordinator started for a failed CREATE was never published.
      if kind == StatementKind::Create {
        manager.shutdown();
      }
    }
  }

  /// Called after every statement. An auto-commit session commits here.
  pub fn end_statement(&mut self) -> Result<(), ProxyError> {
    if self.session.auto_commit {
      self.commit()
    } else {
      Ok(())
    }
  }

  /// Releases every distributed and local lock. New coordinators are published in the
  /// System Table and those of dropped tables are taken out of it.
  pub fn commit(&mut self) -> Result<(), ProxyError> {
    let created = mem::take(&mut self.created);
    let dropped = mem::take(&mut self.dropped);
    let mut result = Ok(());
    for (table, proxy) in mem::take(&mut self.proxies) {
      let manager = proxy.manager().clone();
      let update_id = proxy.release(true);
      debug!("{} committed {} at update {}", self.session.id, table, update_id);
      if dropped.contains(&table) {
        manager.shutdown();
        self.system_table.remove(&table);
      } else if created.contains(&table) && !self.system_table.register(manager.clone()) {
        warn!("another coordinator was registered for {} first", table);
        manager.shutdown();
        if result.is_ok() {
          result = Err(ProxyError::TableExists(table));
        }
      }
    }
    self.database.unlock_all(&self.session);
    for table in &dropped {
      self.database.events().remove(table);
    }
    result
  }

  /// Releases every lock without recording any update. Coordinators started for tables
  /// created in this transaction are shut down.
  pub fn rollback(&mut self) {
    let created = mem::take(&mut self.created);
    self.dropped.clear();
    for (table, proxy) in mem::take(&mut self.proxies) {
      let manager = proxy.manager().clone();
      proxy.release(false);
      if created.contains(&table) {
        manager.shutdown();
      }
    }
    self.database.unlock_all(&self.session);
  }
}
