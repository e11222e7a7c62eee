use crate::common::{SessionId, TableName, TransactionName};
use crate::config::{LockConfig, LockMode};
use crate::deadlock::{find_deadlock, WaitForSnapshot};
use crate::lock_log::{LockEventKind, LockEventLog};
use log::{debug, info};
use std::cmp::min;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[cfg(test)]
#[path = "test/lock_manager_test.rs"]
mod lock_manager_test;

// -----------------------------------------------------------------------------------------------
//  Errors
// -----------------------------------------------------------------------------------------------

/// A cycle of sessions, each waiting for a table the next one holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitChain(pub Vec<SessionId>);

impl fmt::Display for WaitChain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for session in &self.0 {
      write!(f, "{} -> ", session)?;
    }
    match self.0.first() {
      Some(first) => write!(f, "{}", first),
      None => Ok(()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
  #[error("timeout trying to lock table {table}")]
  Timeout { table: TableName },
  #[error("deadlock detected while locking table {table}: {chain}")]
  Deadlock { table: TableName, chain: WaitChain },
}

// -----------------------------------------------------------------------------------------------
//  Session
// -----------------------------------------------------------------------------------------------

/// What the lock manager needs to know about a session of the local engine.
#[derive(Debug, Clone)]
pub struct Session {
  pub id: SessionId,
  /// The logical transaction this session works for. Sessions that serve a call back into
  /// this instance from a remote instance share the transaction of the original caller.
  pub transaction: Option<TransactionName>,
  pub lock_timeout: Duration,
  pub auto_commit: bool,
}

impl Session {
  pub fn new(id: u64, lock_timeout: Duration) -> Session {
    Session { id: SessionId(id), transaction: None, lock_timeout, auto_commit: true }
  }

  pub fn with_transaction(mut self, transaction: &str) -> Session {
    self.transaction = Some(TransactionName(transaction.to_string()));
    self
  }

  pub fn with_auto_commit(mut self, auto_commit: bool) -> Session {
    self.auto_commit = auto_commit;
    self
  }
}

// -----------------------------------------------------------------------------------------------
//  LockGraph
// -----------------------------------------------------------------------------------------------

/// The lock state of one table. A table is either unlocked, held shared by a set of
/// sessions, or held exclusively by one session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct TableLockState {
  exclusive: Option<SessionId>,
  shared: BTreeSet<SessionId>,
  /// Sessions that re-entered the exclusive lock on behalf of the holder's transaction,
  /// with the number of times each did so. Only ever non-empty for the catalog table.
  reentrant: BTreeMap<SessionId, u32>,
}

impl TableLockState {
  fn is_free(&self) -> bool {
    self.exclusive.is_none() && self.shared.is_empty() && self.reentrant.is_empty()
  }

  fn holds(&self, session: &SessionId) -> bool {
    self.exclusive.as_ref() == Some(session)
      || self.shared.contains(session)
      || self.reentrant.contains_key(session)
  }

  fn holders(&self) -> BTreeSet<SessionId> {
    let mut holders = self.shared.clone();
    holders.extend(self.exclusive.iter().cloned());
    holders.extend(self.reentrant.keys().cloned());
    holders
  }

  /// Gives up the exclusive lock. If other sessions of the same transaction still ride on it,
  /// one of them becomes the holder.
  fn release_exclusive(&mut self) {
    self.exclusive = None;
    let first = self.reentrant.keys().next().cloned();
    if let Some(rider) = first {
      let count = self.reentrant.remove(&rider).unwrap_or(1);
      self.exclusive = Some(rider);
      if count > 1 {
        self.reentrant.insert(rider, count - 1);
      }
    }
  }
}

enum Grant {
  Granted,
  Reentered,
  Blocked,
}

/// Everything the lock monitor of a `Database` protects.
#[derive(Debug, Default)]
pub struct LockGraph {
  tables: BTreeMap<TableName, TableLockState>,
  waiting_for: BTreeMap<SessionId, TableName>,
  transactions: BTreeMap<SessionId, TransactionName>,
  held: BTreeMap<SessionId, BTreeSet<TableName>>,
  /// Sessions found to be on a deadlock cycle by another session's check. They fail with
  /// the chain the next time they wake up.
  deadlocked: BTreeMap<SessionId, (TableName, Vec<SessionId>)>,
}

impl LockGraph {
  pub fn snapshot(&self) -> WaitForSnapshot {
    WaitForSnapshot {
      waiting_for: self.waiting_for.clone(),
      holders: self.tables.iter().map(|(t, state)| (t.clone(), state.holders())).collect(),
    }
  }

  fn same_transaction(&self, a: &SessionId, b: &SessionId) -> bool {
    match (self.transactions.get(a), self.transactions.get(b)) {
      (Some(ta), Some(tb)) => ta == tb,
      _ => false,
    }
  }

  fn try_grant(
    &mut self,
    table: &TableName,
    session: SessionId,
    exclusive: bool,
    reentrant_allowed: bool,
  ) -> Grant {
    let holder = self.tables.get(table).and_then(|state| state.exclusive);
    if let Some(holder) = holder {
      if holder == session {
        return Grant::Granted;
      }
      if reentrant_allowed && self.same_transaction(&holder, &session) {
        let state = self.tables.entry(table.clone()).or_default();
        *state.reentrant.entry(session).or_insert(0) += 1;
        return Grant::Reentered;
      }
      return Grant::Blocked;
    }

    let state = self.tables.entry(table.clone()).or_default();
    if exclusive {
      // Free, or the requester is the only shared holder and upgrades.
      let sole_holder = state.shared.len() == 1 && state.shared.contains(&session);
      if state.shared.is_empty() || sole_holder {
        state.shared.remove(&session);
        state.exclusive = Some(session);
        Grant::Granted
      } else {
        Grant::Blocked
      }
    } else {
      state.shared.insert(session);
      Grant::Granted
    }
  }

  /// Releases one hold of `session` on `table`. Returns whether the session still holds it.
  fn release(&mut self, table: &TableName, session: SessionId) -> bool {
    let state = match self.tables.get_mut(table) {
      Some(state) => state,
      None => return false,
    };
    if let Some(count) = state.reentrant.get_mut(&session) {
      *count -= 1;
      if *count == 0 {
        state.reentrant.remove(&session);
      }
    } else if state.exclusive == Some(session) {
      state.release_exclusive();
    } else {
      state.shared.remove(&session);
    }
    let still_holds = state.holds(&session);
    if state.is_free() {
      self.tables.remove(table);
    }
    if !still_holds {
      if let Some(tables) = self.held.get_mut(&session) {
        tables.remove(table);
        if tables.is_empty() {
          self.held.remove(&session);
        }
      }
    }
    still_holds
  }

  fn stop_waiting(&mut self, session: &SessionId) {
    self.waiting_for.remove(session);
  }
}

// -----------------------------------------------------------------------------------------------
//  Database
// -----------------------------------------------------------------------------------------------

/// The lock domain of one local database: a single monitor over all of its table locks.
pub struct Database {
  graph: Mutex<LockGraph>,
  changed: Condvar,
  config: LockConfig,
  events: LockEventLog,
}

impl Database {
  pub fn new(config: LockConfig) -> Arc<Database> {
    let events = LockEventLog::new(config.event_log_capacity);
    let graph = Mutex::new(LockGraph::default());
    Arc::new(Database { graph, changed: Condvar::new(), config, events })
  }

  /// A new session with this database's default lock timeout.
  pub fn session(&self, id: u64) -> Session {
    Session::new(id, self.config.default_lock_timeout)
  }

  pub fn config(&self) -> &LockConfig {
    &self.config
  }

  pub fn events(&self) -> &LockEventLog {
    &self.events
  }

  fn lock_graph(&self) -> MutexGuard<LockGraph> {
    self.graph.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn snapshot(&self) -> WaitForSnapshot {
    self.lock_graph().snapshot()
  }

  pub fn table_lock(self: &Arc<Self>, table: TableName) -> TableLockManager {
    TableLockManager { table, db: self.clone() }
  }

  /// The tables `session` currently holds any lock on.
  pub fn locked_tables(&self, session: &SessionId) -> BTreeSet<TableName> {
    self.lock_graph().held.get(session).cloned().unwrap_or_default()
  }

  /// Releases every lock of `session`, as at commit or rollback.
  pub fn unlock_all(&self, session: &Session) {
    let mut graph = self.lock_graph();
    let tables = graph.held.get(&session.id).cloned().unwrap_or_default();
    for table in &tables {
      while graph.release(table, session.id) {}
      self.events.record(table, session.id, LockEventKind::Released);
    }
    graph.stop_waiting(&session.id);
    graph.transactions.remove(&session.id);
    graph.deadlocked.remove(&session.id);
    self.changed.notify_all();
  }
}

// -----------------------------------------------------------------------------------------------
//  TableLockManager
// -----------------------------------------------------------------------------------------------

/// The lock of one table of a `Database`.
pub struct TableLockManager {
  table: TableName,
  db: Arc<Database>,
}

impl TableLockManager {
  pub fn table(&self) -> &TableName {
    &self.table
  }

  fn is_catalog(&self) -> bool {
    self.table == self.db.config.catalog_table
  }

  /// Locks the table for `session`, blocking until the lock is granted, the session's lock
  /// timeout passes, or a deadlock is found. Returns false if nothing was locked because
  /// table locking is off and the lock wasn't forced.
  pub fn lock(&self, session: &Session, exclusive: bool, force: bool) -> Result<bool, LockError> {
    if self.db.config.lock_mode == LockMode::Off && !force {
      return Ok(false);
    }

    let db = &self.db;
    let mut graph = db.lock_graph();
    match &session.transaction {
      Some(transaction) => {
        graph.transactions.insert(session.id, transaction.clone());
      }
      None => {
        graph.transactions.remove(&session.id);
      }
    }
    graph.deadlocked.remove(&session.id);

    let deadline = Instant::now() + session.lock_timeout;
    let mut check_deadlock = false;
    loop {
      // Another session may have found us on a cycle while we slept.
      if let Some((table, chain)) = graph.deadlocked.remove(&session.id) {
        graph.stop_waiting(&session.id);
        db.events.record(&self.table, session.id, LockEventKind::Deadlock(chain.clone()));
        info!("{} is part of a deadlock on {}", session.id, table);
        return Err(LockError::Deadlock { table, chain: WaitChain(chain) });
      }

      match graph.try_grant(&self.table, session.id, exclusive, self.is_catalog()) {
        Grant::Granted => {
          graph.stop_waiting(&session.id);
          graph.held.entry(session.id).or_default().insert(self.table.clone());
          db.events.record(&self.table, session.id, LockEventKind::Acquired { exclusive });
          debug!("{} locked {} (exclusive: {})", session.id, self.table, exclusive);
          return Ok(true);
        }
        Grant::Reentered => {
          graph.stop_waiting(&session.id);
          graph.held.entry(session.id).or_default().insert(self.table.clone());
          db.events.record(&self.table, session.id, LockEventKind::Reentered);
          debug!("{} re-entered the lock on {}", session.id, self.table);
          return Ok(true);
        }
        Grant::Blocked => {}
      }

      if check_deadlock {
        if let Some(chain) = find_deadlock(session.id, &graph.snapshot()) {
          graph.stop_waiting(&session.id);
          for other in &chain {
            if *other != session.id {
              if let Some(table) = graph.waiting_for.get(other).cloned() {
                graph.deadlocked.insert(*other, (table, chain.clone()));
              }
            }
          }
          db.changed.notify_all();
          db.events.record(&self.table, session.id, LockEventKind::Deadlock(chain.clone()));
          info!("Deadlock on {}: {}", self.table, WaitChain(chain.clone()));
          return Err(LockError::Deadlock { table: self.table.clone(), chain: WaitChain(chain) });
        }
      } else {
        graph.waiting_for.insert(session.id, self.table.clone());
        db.events.record(&self.table, session.id, LockEventKind::Waiting);
      }

      let now = Instant::now();
      if now >= deadline {
        graph.stop_waiting(&session.id);
        db.events.record(&self.table, session.id, LockEventKind::TimedOut);
        info!("{} timed out waiting for {}", session.id, self.table);
        return Err(LockError::Timeout { table: self.table.clone() });
      }
      let wait = min(db.config.deadlock_check, deadline - now);
      graph = match db.changed.wait_timeout(graph, wait) {
        Ok((graph, _)) => graph,
        Err(poisoned) => poisoned.into_inner().0,
      };
      // Only contended locks pay for deadlock detection.
      check_deadlock = true;
    }
  }

  /// Releases one lock of `session` on this table and wakes up all waiters.
  pub fn unlock(&self, session: &Session) {
    let mut graph = self.db.lock_graph();
    graph.release(&self.table, session.id);
    self.db.events.record(&self.table, session.id, LockEventKind::Released);
    self.db.changed.notify_all();
  }

  pub fn is_locked_exclusively_by(&self, session: &Session) -> bool {
    let graph = self.db.lock_graph();
    match graph.tables.get(&self.table) {
      Some(state) => state.exclusive == Some(session.id),
      None => false,
    }
  }

  pub fn is_locked_exclusively(&self) -> bool {
    let graph = self.db.lock_graph();
    graph.tables.get(&self.table).map_or(false, |state| state.exclusive.is_some())
  }

  /// Every session holding any lock on this table.
  pub fn holders(&self) -> BTreeSet<SessionId> {
    let graph = self.db.lock_graph();
    graph.tables.get(&self.table).map(|state| state.holders()).unwrap_or_default()
  }
}
