use super::{LocatorConnection, LocatorQuorumClient};
use crate::common::{LocatorEndpoint, ManualClock};
use crate::locator_protocol::{lock_reply_byte, LocatorError, LocatorRequest, LocatorResponse};
use crate::locator_state::{LocatorReply, LockRegisterState, SharedLockRegister};
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

// -----------------------------------------------------------------------------------------------
//  In-process Locators
// -----------------------------------------------------------------------------------------------

/// A locator living in the same process. `register` is `None` for a locator that is down.
struct LocalLocator {
  endpoint: LocatorEndpoint,
  register: Option<Arc<SharedLockRegister>>,
  /// Answers every SET with a failure, as a locator that can't write its state file.
  refuse_set: bool,
}

impl LocalLocator {
  fn call(&self, request: LocatorRequest) -> Result<LocatorReply, LocatorError> {
    match &self.register {
      Some(register) => Ok(register.handle(request)),
      None => Err(LocatorError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "down"))),
    }
  }
}

impl LocatorConnection for LocalLocator {
  fn endpoint(&self) -> &LocatorEndpoint {
    &self.endpoint
  }

  fn get(&mut self) -> Result<LocatorResponse, LocatorError> {
    match self.call(LocatorRequest::Get)? {
      LocatorReply::Locations(response) => Ok(response),
      _ => Err(LocatorError::Protocol("bad reply".to_string())),
    }
  }

  fn set(&mut self, locations: &BTreeSet<String>) -> Result<bool, LocatorError> {
    if self.refuse_set {
      return Ok(false);
    }
    match self.call(LocatorRequest::Set(locations.clone()))? {
      LocatorReply::Flag(flag) => Ok(flag),
      _ => Err(LocatorError::Protocol("bad reply".to_string())),
    }
  }

  fn lock(&mut self, requester: &str) -> Result<u8, LocatorError> {
    match self.call(LocatorRequest::Lock(requester.to_string()))? {
      LocatorReply::Lock(count) => Ok(lock_reply_byte(count)),
      _ => Err(LocatorError::Protocol("bad reply".to_string())),
    }
  }

  fn commit(&mut self, requester: &str) -> Result<bool, LocatorError> {
    match self.call(LocatorRequest::Commit(requester.to_string()))? {
      LocatorReply::Flag(flag) => Ok(flag),
      _ => Err(LocatorError::Protocol("bad reply".to_string())),
    }
  }
}

fn locs(ls: &[&str]) -> BTreeSet<String> {
  ls.iter().map(|l| l.to_string()).collect()
}

fn mk_register(locations: &[&str]) -> Arc<SharedLockRegister> {
  let mut state = LockRegisterState::new(Duration::from_millis(3000));
  assert!(state.set(locs(locations)));
  Arc::new(SharedLockRegister::new(state, Arc::new(ManualClock::new(0))))
}

fn mk_locator(i: u16, register: Option<Arc<SharedLockRegister>>) -> LocalLocator {
  let endpoint = LocatorEndpoint { host: format!("loc{}", i), port: 29999 };
  LocalLocator { endpoint, register, refuse_set: false }
}

fn mk_client(registers: Vec<Option<Arc<SharedLockRegister>>>) -> LocatorQuorumClient<LocalLocator> {
  let connections =
    registers.into_iter().enumerate().map(|(i, r)| mk_locator(i as u16, r)).collect();
  LocatorQuorumClient::new(connections, 1)
}

// -----------------------------------------------------------------------------------------------
//  get_locations
// -----------------------------------------------------------------------------------------------

#[test]
fn unanimous_locations_test() {
  let mut client = mk_client(vec![
    Some(mk_register(&["X", "Y"])),
    Some(mk_register(&["X", "Y"])),
    Some(mk_register(&["X", "Y"])),
  ]);
  assert_eq!(client.get_locations().unwrap().locations, locs(&["X", "Y"]));
}

#[test]
fn stale_locator_outvoted_test() {
  let mut client = mk_client(vec![
    Some(mk_register(&["X"])),
    Some(mk_register(&["X", "Y"])),
    Some(mk_register(&["X", "Y"])),
  ]);
  assert_eq!(client.get_locations().unwrap().locations, locs(&["X", "Y"]));

  let mut client = mk_client(vec![
    Some(mk_register(&["X", "Y"])),
    Some(mk_register(&["X"])),
    Some(mk_register(&["X", "Y"])),
  ]);
  assert_eq!(client.get_locations().unwrap().locations, locs(&["X", "Y"]));
}

#[test]
fn update_count_splits_votes_test() {
  // Same locations but a different counter is a different answer.
  let bumped = mk_register(&["X"]);
  assert_eq!(bumped.handle(LocatorRequest::Lock("a".to_string())), LocatorReply::Lock(1));
  assert_eq!(bumped.handle(LocatorRequest::Commit("a".to_string())), LocatorReply::Flag(true));
  let mut client =
    mk_client(vec![Some(bumped), Some(mk_register(&["X"])), Some(mk_register(&["Y"]))]);
  assert!(matches!(
    client.get_locations(),
    Err(LocatorError::NoMajority { responded: 3, configured: 3 })
  ));
}

#[test]
fn single_locator_test() {
  let mut client = mk_client(vec![Some(mk_register(&["X"]))]);
  assert_eq!(client.get_locations().unwrap().locations, locs(&["X"]));
}

#[test]
fn unreachable_locators_test() {
  // One down out of three: the two that answer still form a majority.
  let mut client =
    mk_client(vec![None, Some(mk_register(&["X"])), Some(mk_register(&["X"]))]);
  assert_eq!(client.get_locations().unwrap().locations, locs(&["X"]));

  // Two down out of three: the lone answer is not a majority of the configured locators.
  let mut client = mk_client(vec![None, None, Some(mk_register(&["X"]))]);
  let err = client.get_locations().unwrap_err();
  assert!(err.is_startup_blocking());
  assert!(matches!(err, LocatorError::NoMajority { responded: 1, configured: 3 }));
}

#[test]
fn early_majority_weak_spot_test() {
  // With five locators, the first repeated answer wins even though only two of five hold it.
  // This is the known weakness of the early-majority short-circuit.
  let mut client = mk_client(vec![
    Some(mk_register(&["OLD"])),
    Some(mk_register(&["OLD"])),
    Some(mk_register(&["NEW"])),
    Some(mk_register(&["NEW"])),
    Some(mk_register(&["NEW"])),
  ]);
  assert_eq!(client.get_locations().unwrap().locations, locs(&["OLD"]));
  // The locators after the early answer were never asked.
  let unasked = LocatorEndpoint { host: "loc4".to_string(), port: 29999 };
  assert_eq!(client.observed_count(&unasked), None);
}

// -----------------------------------------------------------------------------------------------
//  Creation Lock
// -----------------------------------------------------------------------------------------------

#[test]
fn lock_commit_quorum_test() {
  let registers: Vec<Arc<SharedLockRegister>> = (0..3).map(|_| mk_register(&[])).collect();
  let mut client = mk_client(registers.iter().cloned().map(Some).collect());
  client.get_locations().unwrap();
  assert!(client.lock_locators("db1").unwrap());

  // Somebody else can't take it while it is held.
  let mut other = mk_client(registers.iter().cloned().map(Some).collect());
  other.get_locations().unwrap();
  assert!(!other.lock_locators("db2").unwrap());

  assert!(client.set_locations(&locs(&["db1"])));
  assert!(client.commit_locators("db1"));
  for register in &registers {
    assert_eq!(register.get().update_count, 2);
    assert_eq!(register.get().locations, locs(&["db1"]));
  }
  // A commit without the lock fails everywhere.
  assert!(!other.commit_locators("db2"));
}

#[test]
fn stale_read_lock_test() {
  let registers: Vec<Arc<SharedLockRegister>> = (0..3).map(|_| mk_register(&["X"])).collect();
  let mut client = mk_client(registers.iter().cloned().map(Some).collect());
  client.get_locations().unwrap();

  // Two locators move on between our GET and our LOCK.
  for register in &registers[..2] {
    let lock = register.handle(LocatorRequest::Lock("db9".to_string()));
    assert_eq!(lock, LocatorReply::Lock(1));
    let commit = register.handle(LocatorRequest::Commit("db9".to_string()));
    assert_eq!(commit, LocatorReply::Flag(true));
  }
  // Both still grant the lock, but with a counter that no longer matches what we saw.
  assert!(!client.lock_locators("db1").unwrap());
}

#[test]
fn not_enough_locators_test() {
  let connections = vec![mk_locator(0, Some(mk_register(&[])))];
  let mut client = LocatorQuorumClient::new(connections, 3);
  assert!(matches!(
    client.lock_locators("db1"),
    Err(LocatorError::NotEnoughLocators { configured: 1, minimum: 3 })
  ));
}

#[test]
fn claim_system_table_test() {
  let registers: Vec<Arc<SharedLockRegister>> = (0..3).map(|_| mk_register(&[])).collect();
  let mut client = mk_client(vec![Some(registers[0].clone()), None, Some(registers[2].clone())]);
  assert!(client.claim_system_table("db1#1", "jdbc:h2:tcp://db1/shop").unwrap());
  assert_eq!(client.get_locations().unwrap().locations, locs(&["jdbc:h2:tcp://db1/shop"]));
  assert_eq!(registers[1].get().update_count, 1);

  // A second claimer that can't lock a majority backs off.
  let held = mk_register(&[]);
  assert!(matches!(held.handle(LocatorRequest::Lock("db2".to_string())), LocatorReply::Lock(1)));
  let mut client = mk_client(vec![Some(held.clone()), Some(held), Some(mk_register(&[]))]);
  assert!(!client.claim_system_table("db3#1", "jdbc:h2:tcp://db3/shop").unwrap());
}

#[test]
fn failed_claim_bumps_counts_test() {
  let registers: Vec<Arc<SharedLockRegister>> = (0..3).map(|_| mk_register(&["X"])).collect();
  let mut bystander = mk_client(registers.iter().cloned().map(Some).collect());
  bystander.get_locations().unwrap();

  let mut client = mk_client(registers.iter().cloned().map(Some).collect());
  for conn in &mut client.connections {
    conn.refuse_set = true;
  }
  assert!(!client.claim_system_table("db1#1", "Y").unwrap());
  // The lock was given back, with a COMMIT that moved every counter on.
  for register in &registers {
    let response = register.get();
    assert_eq!(response.locations, locs(&["X"]));
    assert_eq!(response.update_count, 2);
  }
  // What the bystander saw before is stale now.
  assert!(!bystander.lock_locators("db2#1").unwrap());
  for register in &registers {
    register.handle(LocatorRequest::Commit("db2#1".to_string()));
  }
  bystander.get_locations().unwrap();
  assert!(bystander.lock_locators("db2#1").unwrap());
}
