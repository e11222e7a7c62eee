use super::{LocatorReply, LockRegisterState, SharedLockRegister};
use crate::common::{ManualClock, Timestamp};
use crate::locator_protocol::LocatorRequest;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn locs(ls: &[&str]) -> BTreeSet<String> {
  ls.iter().map(|l| l.to_string()).collect()
}

fn mk_state() -> LockRegisterState {
  LockRegisterState::new(Duration::from_millis(3000))
}

#[test]
fn set_get_test() {
  let mut state = mk_state();
  let before = state.get().update_count;
  assert!(state.set(locs(&["c", "a", "b"])));
  let response = state.get();
  assert_eq!(response.locations, locs(&["a", "b", "c"]));
  // SET never bumps the counter.
  assert_eq!(response.update_count, before);
  assert!(state.set(locs(&["d"])));
  assert_eq!(state.get().locations, locs(&["d"]));
}

#[test]
fn lock_commit_lifecycle_test() {
  let mut state = mk_state();
  let t = Timestamp(1000);
  let count = state.lock("id1", t);
  assert_eq!(count, state.update_count());
  assert!(count > 0);
  // Held, so a second requester is denied, and LOCK doesn't bump the counter.
  assert_eq!(state.lock("id2", t), 0);
  assert_eq!(state.update_count(), count);
  // Only the holder can commit.
  assert!(!state.commit("id2"));
  assert!(state.commit("id1"));
  assert_eq!(state.update_count(), count + 1);
  assert!(state.creation_lock().is_none());
  // Released, so the next requester gets it with the bumped count.
  assert_eq!(state.lock("id2", t), count + 1);
  assert!(state.commit("id2"));
  // A COMMIT without a LOCK fails.
  assert!(!state.commit("id2"));
}

#[test]
fn relock_by_holder_denied_test() {
  let mut state = mk_state();
  assert!(state.lock("id1", Timestamp(0)) > 0);
  assert_eq!(state.lock("id1", Timestamp(10)), 0);
}

#[test]
fn lock_expiry_test() {
  let mut state = mk_state();
  assert!(state.lock("id1", Timestamp(1000)) > 0);
  // Exactly at the timeout the lock is still live.
  assert_eq!(state.lock("id2", Timestamp(4000)), 0);
  // Past it, the lock is abandoned and goes to the new requester.
  assert!(state.lock("id2", Timestamp(4001)) > 0);
  assert_eq!(state.creation_lock().unwrap().holder, "id2");
  // The original holder lost it.
  assert!(!state.commit("id1"));
  assert!(state.commit("id2"));
}

#[test]
fn persistence_test() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("locator.state");
  {
    let mut state = LockRegisterState::open(&path, Duration::from_millis(3000)).unwrap();
    assert!(state.set(locs(&["x", "y"])));
    assert!(state.lock("id1", Timestamp(0)) > 0);
    assert!(state.commit("id1"));
    assert!(state.lock("id2", Timestamp(0)) > 0);
  }
  let state = LockRegisterState::open(&path, Duration::from_millis(3000)).unwrap();
  assert_eq!(state.locations(), &locs(&["x", "y"]));
  assert_eq!(state.update_count(), 2);
  // The outstanding lock of the previous incarnation is not restored.
  assert!(state.creation_lock().is_none());
}

#[test]
fn shared_register_test() {
  let clock = Arc::new(ManualClock::new(0));
  let register = SharedLockRegister::new(mk_state(), clock.clone());
  assert_eq!(
    register.handle(LocatorRequest::Set(locs(&["x"]))),
    LocatorReply::Flag(true)
  );
  assert_eq!(register.handle(LocatorRequest::Lock("a".to_string())), LocatorReply::Lock(1));
  assert_eq!(register.handle(LocatorRequest::Lock("b".to_string())), LocatorReply::Lock(0));
  clock.advance(3001);
  assert_eq!(register.handle(LocatorRequest::Lock("b".to_string())), LocatorReply::Lock(1));
  assert_eq!(register.handle(LocatorRequest::Commit("b".to_string())), LocatorReply::Flag(true));
  match register.handle(LocatorRequest::Get) {
    LocatorReply::Locations(response) => {
      assert_eq!(response.update_count, 2);
      assert_eq!(response.locations, locs(&["x"]));
    }
    other => panic!("unexpected reply {:?}", other),
  }
}
