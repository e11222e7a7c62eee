use crate::common::{DatabaseUrl, TableName, TransactionName};
use crate::lock_manager::LockError;
use crate::lock_type::{LockRequest, LockType};
use crate::replica_set::{Replica, ReplicaSet};
use crate::table_manager::TableManager;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

// -----------------------------------------------------------------------------------------------
//  Errors
// -----------------------------------------------------------------------------------------------

/// The failure of one replica to run a statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
  #[error("replica {0} is unreachable")]
  Unreachable(DatabaseUrl),
  #[error("replica {location} rejected the statement: {reason}")]
  Rejected { location: DatabaseUrl, reason: String },
}

impl ReplicaError {
  pub fn location(&self) -> &DatabaseUrl {
    match self {
      ReplicaError::Unreachable(location) => location,
      ReplicaError::Rejected { location, .. } => location,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
  #[error("a {held:?} lock on table {table} does not allow {required:?}")]
  LockDenied { table: TableName, held: LockType, required: LockType },
  #[error("timeout trying to get a {requested:?} lock on table {table}")]
  LockTimeout { table: TableName, requested: LockType },
  #[error("table {0} already exists")]
  TableExists(TableName),
  #[error("table {0} not found")]
  UnknownTable(TableName),
  #[error("the coordinator of table {0} is not available")]
  CoordinatorUnavailable(TableName),
  #[error("statement failed on every replica of table {table}")]
  AllReplicasFailed { table: TableName, failures: Vec<ReplicaError> },
  #[error(transparent)]
  Local(#[from] LockError),
}

// -----------------------------------------------------------------------------------------------
//  ReplicaExecutor
// -----------------------------------------------------------------------------------------------

/// Runs a statement on the database instance at some location, under the given transaction.
/// Returns the row or update count.
pub trait ReplicaExecutor: Send + Sync {
  fn execute(
    &self,
    location: &DatabaseUrl,
    sql: &str,
    transaction: &TransactionName,
  ) -> Result<i64, ReplicaError>;
}

// -----------------------------------------------------------------------------------------------
//  TableProxy
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCopy {
  pub location: DatabaseUrl,
  pub local: bool,
}

impl Replica for ReplicaCopy {
  fn location(&self) -> &DatabaseUrl {
    &self.location
  }

  fn is_local(&self) -> bool {
    self.local
  }
}

/// A granted distributed lock on one table, bound to the replicas known at grant time.
/// Replicas that fail a statement drop out of `replicas` and are kept in `dead`.
#[derive(Debug)]
pub struct TableProxy {
  lock_type: LockType,
  replicas: ReplicaSet<ReplicaCopy>,
  dead: BTreeSet<DatabaseUrl>,
  failures: Vec<ReplicaError>,
  manager: Arc<TableManager>,
  request: LockRequest,
  local: DatabaseUrl,
}

impl TableProxy {
  pub fn new(
    manager: Arc<TableManager>,
    request: LockRequest,
    lock_type: LockType,
    local: DatabaseUrl,
  ) -> TableProxy {
    let mut replicas = ReplicaSet::empty(manager.table().clone());
    let mut dead = BTreeSet::new();
    // The primary goes in first so that the set agrees with the coordinator about it.
    if let Some(primary) = manager.primary_location() {
      let is_local = primary == local;
      replicas.add_copy(ReplicaCopy { location: primary, local: is_local });
    }
    for (location, active) in manager.replica_locations() {
      if !active {
        dead.insert(location);
      } else if !replicas.contains(&location) {
        let is_local = location == local;
        replicas.add_copy(ReplicaCopy { location, local: is_local });
      }
    }
    TableProxy { lock_type, replicas, dead, failures: Vec::new(), manager, request, local }
  }

  pub fn table(&self) -> &TableName {
    self.manager.table()
  }

  pub fn lock_type(&self) -> LockType {
    self.lock_type
  }

  pub fn manager(&self) -> &Arc<TableManager> {
    &self.manager
  }

  pub fn request(&self) -> &LockRequest {
    &self.request
  }

  pub fn failures(&self) -> &[ReplicaError] {
    &self.failures
  }

  /// Every replica this proxy knows of, with whether it is still in step.
  pub fn replicas(&self) -> BTreeMap<DatabaseUrl, bool> {
    let mut replicas: BTreeMap<DatabaseUrl, bool> =
      self.dead.iter().map(|location| (location.clone(), false)).collect();
    for copy in self.replicas.all_copies() {
      replicas.insert(copy.location.clone(), true);
    }
    replicas
  }

  /// Whether the granted lock is enough to do what needs `required`.
  pub fn satisfies(&self, required: LockType) -> bool {
    self.lock_type.satisfies(required)
  }

  fn require(&self, required: LockType) -> Result<(), ProxyError> {
    if self.satisfies(required) {
      Ok(())
    } else {
      Err(ProxyError::LockDenied {
        table: self.table().clone(),
        held: self.lock_type,
        required,
      })
    }
  }

  fn replica_failed(&mut self, error: ReplicaError) {
    let location = error.location().clone();
    warn!("{} failed on replica {}: {}", self.table(), location, error);
    self.replicas.remove_copy(&location);
    self.manager.mark_inactive(&location);
    self.dead.insert(location);
    self.failures.push(error);
  }

  /// Runs `sql` on every live replica. A replica that fails is recorded and dropped but does
  /// not undo the others. Returns the count of the local replica, else of the primary, else
  /// of the first replica that succeeded.
  ///
  /// If no replica succeeded the statement is aborted. Nothing diverged, so no replica is
  /// dropped.
  pub fn execute_update(
    &mut self,
    executor: &dyn ReplicaExecutor,
    sql: &str,
    transaction: &TransactionName,
  ) -> Result<i64, ProxyError> {
    self.require(LockType::Write)?;
    let primary = self.replicas.primary_copy().map(|copy| copy.location.clone());
    let targets: Vec<DatabaseUrl> =
      self.replicas.all_copies().iter().map(|copy| copy.location.clone()).collect();
    let mut local_count = None;
    let mut primary_count = None;
    let mut first_count = None;
    let mut failures = Vec::new();
    for location in targets {
      match executor.execute(&location, sql, transaction) {
        Ok(count) => {
          debug!("{} updated {} rows on {}", self.table(), count, location);
          if location == self.local {
            local_count = Some(count);
          }
          if Some(&location) == primary.as_ref() {
            primary_count = Some(count);
          }
          first_count.get_or_insert(count);
        }
        Err(error) => failures.push(error),
      }
    }
    match local_count.or(primary_count).or(first_count) {
      Some(count) => {
        for error in failures {
          self.replica_failed(error);
        }
        Ok(count)
      }
      None => {
        warn!("{} failed on every replica, statement aborted", self.table());
        Err(ProxyError::AllReplicasFailed { table: self.table().clone(), failures })
      }
    }
  }

  /// Runs a read on one replica, the local one if it is live, moving on to the next copy if
  /// a replica fails.
  pub fn execute_query(
    &mut self,
    executor: &dyn ReplicaExecutor,
    sql: &str,
    transaction: &TransactionName,
  ) -> Result<i64, ProxyError> {
    self.require(LockType::Read)?;
    while let Some(location) = self.replicas.get_a_copy().map(|copy| copy.location.clone()) {
      match executor.execute(&location, sql, transaction) {
        Ok(count) => return Ok(count),
        Err(error) => self.replica_failed(error),
      }
    }
    let failures = self.failures.clone();
    Err(ProxyError::AllReplicasFailed { table: self.table().clone(), failures })
  }

  /// Registers a new copy at `location`, both with the coordinator and with this proxy, so
  /// that updates made under this grant already reach it.
  pub fn add_replica(&mut self, location: DatabaseUrl) {
    self.manager.add_replica(location.clone());
    self.dead.remove(&location);
    let local = location == self.local;
    self.replicas.add_copy(ReplicaCopy { location, local });
  }

  /// Gives the grant back to the coordinator. Returns the update id of a committed update,
  /// or 0.
  pub fn release(self, committed: bool) -> u64 {
    let updated: BTreeSet<DatabaseUrl> =
      self.replicas.all_copies().iter().map(|copy| copy.location.clone()).collect();
    self.manager.release_lock(self.request.session(), committed, &updated)
  }
}
