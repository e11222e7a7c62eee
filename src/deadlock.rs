use crate::common::{SessionId, TableName};
use std::collections::{BTreeMap, BTreeSet};

// -----------------------------------------------------------------------------------------------
//  Wait-For Graph
// -----------------------------------------------------------------------------------------------

/// A consistent picture of who waits for what, taken under the database's lock monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitForSnapshot {
  /// The table each blocked session is waiting to lock.
  pub waiting_for: BTreeMap<SessionId, TableName>,
  /// Every session holding a lock (shared or exclusive) on each table.
  pub holders: BTreeMap<TableName, BTreeSet<SessionId>>,
}

/// Looks for a cycle that leads back to `origin`, following "session waits for table, table
/// is held by session" edges. Returns the sessions on the cycle in walk order, starting with
/// `origin`.
pub fn find_deadlock(origin: SessionId, snapshot: &WaitForSnapshot) -> Option<Vec<SessionId>> {
  let mut path = vec![origin];
  let mut visited = BTreeSet::new();
  visited.insert(origin);
  if find_deadlock_r(origin, origin, snapshot, &mut path, &mut visited) {
    Some(path)
  } else {
    None
  }
}

fn find_deadlock_r(
  origin: SessionId,
  session: SessionId,
  snapshot: &WaitForSnapshot,
  path: &mut Vec<SessionId>,
  visited: &mut BTreeSet<SessionId>,
) -> bool {
  let table = match snapshot.waiting_for.get(&session) {
    Some(table) => table,
    None => return false,
  };
  let holders = match snapshot.holders.get(table) {
    Some(holders) => holders,
    None => return false,
  };
  for holder in holders {
    // A session waiting to upgrade its own shared lock is not waiting for itself.
    if *holder == session {
      continue;
    }
    if *holder == origin {
      return true;
    }
    if visited.insert(*holder) {
      path.push(*holder);
      if find_deadlock_r(origin, *holder, snapshot, path, visited) {
        return true;
      }
      path.pop();
    }
  }
  false
}

#[cfg(test)]
mod tests {
  use super::*;

  fn s(id: u64) -> SessionId {
    SessionId(id)
  }

  fn t(name: &str) -> TableName {
    TableName::new("PUBLIC", name)
  }

  fn snapshot(waits: &[(u64, &str)], holds: &[(&str, &[u64])]) -> WaitForSnapshot {
    let mut snapshot = WaitForSnapshot::default();
    for (session, table) in waits {
      snapshot.waiting_for.insert(s(*session), t(table));
    }
    for (table, sessions) in holds {
      snapshot.holders.insert(t(table), sessions.iter().map(|id| s(*id)).collect());
    }
    snapshot
  }

  #[test]
  fn two_way_cycle_test() {
    let snap = snapshot(&[(1, "T2"), (2, "T1")], &[("T1", &[1]), ("T2", &[2])]);
    assert_eq!(find_deadlock(s(1), &snap), Some(vec![s(1), s(2)]));
    assert_eq!(find_deadlock(s(2), &snap), Some(vec![s(2), s(1)]));
  }

  #[test]
  fn three_way_cycle_test() {
    let snap = snapshot(
      &[(1, "B"), (2, "C"), (3, "A")],
      &[("A", &[1]), ("B", &[2]), ("C", &[3])],
    );
    assert_eq!(find_deadlock(s(1), &snap), Some(vec![s(1), s(2), s(3)]));
  }

  #[test]
  fn plain_wait_test() {
    // 1 waits for 2, who isn't waiting for anything.
    let snap = snapshot(&[(1, "T2")], &[("T1", &[1]), ("T2", &[2])]);
    assert_eq!(find_deadlock(s(1), &snap), None);
    // Not waiting at all.
    assert_eq!(find_deadlock(s(2), &snap), None);
  }

  #[test]
  fn cycle_not_through_origin_test() {
    // 2 and 3 deadlock each other, 1 merely waits on them. The walk must terminate.
    let snap = snapshot(
      &[(1, "B"), (2, "C"), (3, "B")],
      &[("B", &[2]), ("C", &[3])],
    );
    assert_eq!(find_deadlock(s(1), &snap), None);
    assert_eq!(find_deadlock(s(2), &snap), Some(vec![s(2), s(3)]));
  }

  #[test]
  fn shared_upgrade_cycle_test() {
    // Both hold shared locks on T and both want to upgrade.
    let snap = snapshot(&[(1, "T"), (2, "T")], &[("T", &[1, 2])]);
    assert_eq!(find_deadlock(s(1), &snap), Some(vec![s(1), s(2)]));
    // A lone upgrader isn't deadlocked with itself.
    let snap = snapshot(&[(1, "T")], &[("T", &[1])]);
    assert_eq!(find_deadlock(s(1), &snap), None);
  }
}
