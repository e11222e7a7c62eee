use crate::common::{Clock, Timestamp};
use crate::locator_protocol::{LocatorError, LocatorRequest, LocatorResponse};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[cfg(test)]
#[path = "test/locator_state_test.rs"]
mod locator_state_test;

// -----------------------------------------------------------------------------------------------
//  LockRegisterState
// -----------------------------------------------------------------------------------------------

/// The part of the register that survives a restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct PersistedRegister {
  update_count: u32,
  locations: BTreeSet<String>,
}

/// The creation lock handed out by LOCK and released by COMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationLock {
  pub holder: String,
  pub created_at: Timestamp,
}

/// A locator's record of where the System Table replicas are. At most one database instance
/// at a time holds the creation lock, which entitles it to create a new System Table.
#[derive(Debug)]
pub struct LockRegisterState {
  locations: BTreeSet<String>,
  /// Bumped on every successful COMMIT. Starts at 1 so that a granted LOCK is never 0.
  update_count: u32,
  lock: Option<CreationLock>,
  lock_timeout: Duration,
  file: Option<PathBuf>,
}

impl LockRegisterState {
  pub fn new(lock_timeout: Duration) -> LockRegisterState {
    LockRegisterState {
      locations: BTreeSet::new(),
      update_count: 1,
      lock: None,
      lock_timeout,
      file: None,
    }
  }

  /// Binds the register to `path`, loading what was persisted there if the file exists.
  pub fn open(path: &Path, lock_timeout: Duration) -> Result<LockRegisterState, LocatorError> {
    let mut state = LockRegisterState::new(lock_timeout);
    if path.exists() {
      let bytes = fs::read(path)?;
      let persisted: PersistedRegister = rmp_serde::from_read_ref(&bytes)?;
      info!(
        "Loaded locator state from {:?}: update count {}, {} location(s)",
        path,
        persisted.update_count,
        persisted.locations.len()
      );
      state.update_count = persisted.update_count;
      state.locations = persisted.locations;
    }
    state.file = Some(path.to_path_buf());
    Ok(state)
  }

  pub fn update_count(&self) -> u32 {
    self.update_count
  }

  pub fn locations(&self) -> &BTreeSet<String> {
    &self.locations
  }

  pub fn creation_lock(&self) -> Option<&CreationLock> {
    self.lock.as_ref()
  }

  pub fn get(&self) -> LocatorResponse {
    LocatorResponse { update_count: self.update_count, locations: self.locations.clone() }
  }

  /// Replaces the full location set. The update count is left alone.
  pub fn set(&mut self, locations: BTreeSet<String>) -> bool {
    let previous = std::mem::replace(&mut self.locations, locations);
    if let Err(e) = self.persist() {
      error!("Could not persist locator locations: {}", e);
      self.locations = previous;
      return false;
    }
    true
  }

  /// Grants the creation lock to `requester` if nobody holds it, or if the holder has kept
  /// it past the lock timeout. Returns the update count if granted, 0 otherwise.
  pub fn lock(&mut self, requester: &str, now: Timestamp) -> u32 {
    if let Some(held) = &self.lock {
      let age = now.millis_since(held.created_at);
      if age <= self.lock_timeout.as_millis() {
        debug!("LOCK by {} denied, held by {} for {} ms", requester, held.holder, age);
        return 0;
      }
      info!(
        "Recovering creation lock abandoned by {} after {} ms, granting it to {}",
        held.holder, age, requester
      );
    }
    self.lock = Some(CreationLock { holder: requester.to_string(), created_at: now });
    self.update_count
  }

  /// Releases the creation lock if `requester` holds it, and bumps the update count.
  pub fn commit(&mut self, requester: &str) -> bool {
    match &self.lock {
      Some(held) if held.holder == requester => {}
      _ => {
        debug!("COMMIT by {} rejected, it does not hold the lock", requester);
        return false;
      }
    }
    self.update_count += 1;
    if let Err(e) = self.persist() {
      error!("Could not persist locator update count: {}", e);
      self.update_count -= 1;
      return false;
    }
    self.lock = None;
    true
  }

  fn persist(&self) -> Result<(), LocatorError> {
    if let Some(path) = &self.file {
      let persisted =
        PersistedRegister { update_count: self.update_count, locations: self.locations.clone() };
      let bytes = rmp_serde::to_vec(&persisted)?;
      // Write aside and rename, so a crash never leaves a torn state file.
      let tmp = path.with_extension("tmp");
      fs::write(&tmp, &bytes)?;
      fs::rename(&tmp, path)?;
    }
    Ok(())
  }
}

// -----------------------------------------------------------------------------------------------
//  SharedLockRegister
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorReply {
  Locations(LocatorResponse),
  Flag(bool),
  Lock(u32),
}

/// The register as shared by all worker threads of a server. Any number of GETs proceed in
/// parallel; SET, LOCK and COMMIT are exclusive and totally ordered.
pub struct SharedLockRegister {
  state: RwLock<LockRegisterState>,
  clock: Arc<dyn Clock>,
}

impl SharedLockRegister {
  pub fn new(state: LockRegisterState, clock: Arc<dyn Clock>) -> SharedLockRegister {
    SharedLockRegister { state: RwLock::new(state), clock }
  }

  pub fn get(&self) -> LocatorResponse {
    self.state.read().unwrap_or_else(PoisonError::into_inner).get()
  }

  pub fn handle(&self, request: LocatorRequest) -> LocatorReply {
    match request {
      LocatorRequest::Get => LocatorReply::Locations(self.get()),
      LocatorRequest::Set(locations) => {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        LocatorReply::Flag(state.set(locations))
      }
      LocatorRequest::Lock(requester) => {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        LocatorReply::Lock(state.lock(&requester, now))
      }
      LocatorRequest::Commit(requester) => {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        LocatorReply::Flag(state.commit(&requester))
      }
    }
  }
}
