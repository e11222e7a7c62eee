use crate::common::{DatabaseUrl, TableName};
use crate::lock_type::{LockRequest, LockType, SessionDescriptor};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

// -----------------------------------------------------------------------------------------------
//  TableManager
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
  /// Whether the replica took every committed update so far.
  pub active: bool,
  /// The last update id the replica is known to have applied.
  pub update_id: u64,
}

#[derive(Debug, Default)]
struct ManagerState {
  /// Replica locations in the order they were added. The first is the primary.
  replicas: Vec<(DatabaseUrl, ReplicaInfo)>,
  writer: Option<(SessionDescriptor, LockType)>,
  readers: BTreeSet<SessionDescriptor>,
  /// Incremented on every committed update.
  update_id: u64,
}

impl ManagerState {
  fn replica_mut(&mut self, location: &DatabaseUrl) -> Option<&mut ReplicaInfo> {
    self.replicas.iter_mut().find(|(l, _)| l == location).map(|(_, info)| info)
  }
}

/// The coordinator of one table across the cluster: it grants the distributed locks on the
/// table and knows where its replicas are.
#[derive(Debug)]
pub struct TableManager {
  table: TableName,
  state: Mutex<ManagerState>,
  alive: AtomicBool,
}

impl TableManager {
  pub fn new(table: TableName, first_replica: Option<DatabaseUrl>) -> TableManager {
    let mut state = ManagerState::default();
    if let Some(location) = first_replica {
      state.replicas.push((location, ReplicaInfo { active: true, update_id: 0 }));
    }
    TableManager { table, state: Mutex::new(state), alive: AtomicBool::new(true) }
  }

  pub fn table(&self) -> &TableName {
    &self.table
  }

  fn lock_state(&self) -> MutexGuard<ManagerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Whether this coordinator still answers for its table.
  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  pub fn shutdown(&self) {
    self.alive.store(false, Ordering::SeqCst);
  }

  /// Tries to grant `request`. Returns the granted lock type, or `LockType::None` if the
  /// request conflicts with another session's lock.
  ///
  /// A DROP is granted as WRITE to an auto-commit session, since its effect is immediately
  /// final, and as DROP otherwise.
  pub fn request_lock(&self, request: &LockRequest) -> LockType {
    let mut guard = self.lock_state();
    let state = &mut *guard;
    let session = request.session();
    let granted = match request.lock_type() {
      LockType::None => LockType::None,
      LockType::Read => match &state.writer {
        Some((writer, held)) if writer == session => *held,
        Some(_) => LockType::None,
        None => {
          state.readers.insert(session.clone());
          LockType::Read
        }
      },
      requested => {
        let mut granted = match requested {
          LockType::Drop if session.auto_commit => LockType::Write,
          other => other,
        };
        // A holder asking again keeps its grant unless the new one is stronger.
        if let Some((writer, held)) = &state.writer {
          if writer == session && held.satisfies(granted) {
            granted = *held;
          }
        }
        let free = match &state.writer {
          Some((writer, _)) => writer == session,
          None => state.readers.iter().all(|reader| reader == session),
        };
        if free {
          state.readers.remove(session);
          state.writer = Some((session.clone(), granted));
          granted
        } else {
          LockType::None
        }
      }
    };
    debug!(
      "{} requested {:?} on {}, granted {:?}",
      session.database,
      request.lock_type(),
      self.table,
      granted
    );
    granted
  }

  /// Releases whatever `session` holds. If it held an exclusive grant and `committed` is
  /// true, the update is recorded on `updated_replicas` and the new update id is returned.
  /// Replicas that missed the update are marked inactive. A DROP returns 0.
  pub fn release_lock(
    &self,
    session: &SessionDescriptor,
    committed: bool,
    updated_replicas: &BTreeSet<DatabaseUrl>,
  ) -> u64 {
    let mut guard = self.lock_state();
    let state = &mut *guard;
    state.readers.remove(session);
    let held = match &state.writer {
      Some((writer, held)) if writer == session => *held,
      _ => return 0,
    };
    state.writer = None;
    if !committed || held == LockType::Drop {
      return 0;
    }
    state.update_id += 1;
    let update_id = state.update_id;
    for (location, info) in &mut state.replicas {
      if updated_replicas.contains(location) {
        info.update_id = update_id;
      } else {
        info.active = false;
      }
    }
    update_id
  }

  pub fn add_replica(&self, location: DatabaseUrl) {
    let mut guard = self.lock_state();
    let state = &mut *guard;
    let update_id = state.update_id;
    match state.replica_mut(&location) {
      Some(info) => *info = ReplicaInfo { active: true, update_id },
      None => state.replicas.push((location, ReplicaInfo { active: true, update_id })),
    }
  }

  /// Returns whether the location was a replica.
  pub fn remove_replica(&self, location: &DatabaseUrl) -> bool {
    let mut state = self.lock_state();
    let before = state.replicas.len();
    state.replicas.retain(|(l, _)| l != location);
    state.replicas.len() != before
  }

  pub fn mark_inactive(&self, location: &DatabaseUrl) {
    if let Some(info) = self.lock_state().replica_mut(location) {
      info.active = false;
    }
  }

  /// Every replica location, with whether it is up to date.
  pub fn replica_locations(&self) -> BTreeMap<DatabaseUrl, bool> {
    self.lock_state().replicas.iter().map(|(l, info)| (l.clone(), info.active)).collect()
  }

  pub fn replica_info(&self, location: &DatabaseUrl) -> Option<ReplicaInfo> {
    self.lock_state().replicas.iter().find(|(l, _)| l == location).map(|(_, info)| info.clone())
  }

  pub fn primary_location(&self) -> Option<DatabaseUrl> {
    let state = self.lock_state();
    let active = state.replicas.iter().find(|(_, info)| info.active);
    active.or_else(|| state.replicas.first()).map(|(l, _)| l.clone())
  }

  pub fn update_id(&self) -> u64 {
    self.lock_state().update_id
  }

  /// The current exclusive holder, if any.
  pub fn writer(&self) -> Option<(SessionDescriptor, LockType)> {
    self.lock_state().writer.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::{RequestId, SessionId, Timestamp};

  fn sd(id: u64, auto_commit: bool) -> SessionDescriptor {
    let database = DatabaseUrl("db1".to_string());
    SessionDescriptor { database, session_id: SessionId(id), auto_commit }
  }

  fn req(session: &SessionDescriptor, lock_type: LockType) -> LockRequest {
    LockRequest::new(RequestId(0), session.clone(), lock_type, Timestamp(0))
  }

  fn url(s: &str) -> DatabaseUrl {
    DatabaseUrl(s.to_string())
  }

  fn mk_manager() -> TableManager {
    TableManager::new(TableName::new("PUBLIC", "T"), Some(url("db1")))
  }

  #[test]
  fn grant_policy_test() {
    let manager = mk_manager();
    let (a, b) = (sd(1, true), sd(2, true));
    assert_eq!(manager.request_lock(&req(&a, LockType::Read)), LockType::Read);
    assert_eq!(manager.request_lock(&req(&b, LockType::Read)), LockType::Read);
    // Two readers, so nobody writes.
    assert_eq!(manager.request_lock(&req(&a, LockType::Write)), LockType::None);
    manager.release_lock(&b, true, &BTreeSet::new());
    // The sole reader upgrades.
    assert_eq!(manager.request_lock(&req(&a, LockType::Write)), LockType::Write);
    assert_eq!(manager.request_lock(&req(&b, LockType::Read)), LockType::None);
    // The writer reading keeps its write grant.
    assert_eq!(manager.request_lock(&req(&a, LockType::Read)), LockType::Write);
  }

  #[test]
  fn drop_grant_test() {
    let manager = mk_manager();
    let auto = sd(1, true);
    assert_eq!(manager.request_lock(&req(&auto, LockType::Drop)), LockType::Write);
    manager.release_lock(&auto, false, &BTreeSet::new());
    let manual = sd(2, false);
    assert_eq!(manager.request_lock(&req(&manual, LockType::Drop)), LockType::Drop);
    let replicas: BTreeSet<DatabaseUrl> = vec![url("db1")].into_iter().collect();
    assert_eq!(manager.release_lock(&manual, true, &replicas), 0);
    assert_eq!(manager.update_id(), 0);
  }

  #[test]
  fn update_ids_test() {
    let manager = mk_manager();
    manager.add_replica(url("db2"));
    let a = sd(1, true);
    assert_eq!(manager.request_lock(&req(&a, LockType::Write)), LockType::Write);
    let updated: BTreeSet<DatabaseUrl> = vec![url("db2")].into_iter().collect();
    assert_eq!(manager.release_lock(&a, true, &updated), 1);
    // db1 missed the update, so db2 is now the primary.
    assert_eq!(manager.replica_info(&url("db1")).unwrap().active, false);
    assert_eq!(manager.replica_info(&url("db2")).unwrap().update_id, 1);
    assert_eq!(manager.primary_location(), Some(url("db2")));
    // An uncommitted release changes nothing.
    assert_eq!(manager.request_lock(&req(&a, LockType::Write)), LockType::Write);
    assert_eq!(manager.release_lock(&a, false, &updated), 0);
    assert_eq!(manager.update_id(), 1);
    assert!(manager.writer().is_none());
  }

  #[test]
  fn replica_membership_test() {
    let manager = mk_manager();
    manager.add_replica(url("db2"));
    manager.add_replica(url("db2"));
    assert_eq!(manager.replica_locations().len(), 2);
    assert!(manager.remove_replica(&url("db1")));
    assert!(!manager.remove_replica(&url("db1")));
    assert_eq!(manager.primary_location(), Some(url("db2")));
    manager.shutdown();
    assert!(!manager.is_alive());
  }
}
