use crate::common::{DatabaseUrl, TableName};

// -----------------------------------------------------------------------------------------------
//  ReplicaSet
// -----------------------------------------------------------------------------------------------

/// One copy of a table, hosted by some database instance.
pub trait Replica {
  fn location(&self) -> &DatabaseUrl;
  /// Whether the copy lives on this instance, so reading it needs no network hop.
  fn is_local(&self) -> bool;
}

/// The copies of one logical table known to this instance. The primary and local copies
/// are always members of `copies` (or absent).
#[derive(Debug)]
pub struct ReplicaSet<R: Replica> {
  table: TableName,
  copies: Vec<R>,
  primary: Option<usize>,
  local: Option<usize>,
}

impl<R: Replica> ReplicaSet<R> {
  pub fn new(table: TableName, first: R) -> ReplicaSet<R> {
    let mut set = ReplicaSet::empty(table);
    set.add_copy(first);
    set
  }

  pub fn empty(table: TableName) -> ReplicaSet<R> {
    ReplicaSet { table, copies: Vec::new(), primary: None, local: None }
  }

  pub fn table(&self) -> &TableName {
    &self.table
  }

  /// Adds a copy, replacing any copy already known at the same location. The first copy
  /// added becomes the primary.
  pub fn add_copy(&mut self, copy: R) {
    let existing = self.copies.iter().position(|c| c.location() == copy.location());
    let index = match existing {
      Some(index) => {
        self.copies[index] = copy;
        index
      }
      None => {
        self.copies.push(copy);
        self.copies.len() - 1
      }
    };
    if self.primary.is_none() {
      self.primary = Some(index);
    }
    if self.copies[index].is_local() {
      self.local = Some(index);
    } else if self.local == Some(index) {
      self.local = None;
    }
  }

  /// Removes the copy at `location`. Returns false exactly when that was the last copy,
  /// after which the set is empty and should be discarded.
  pub fn remove_copy(&mut self, location: &DatabaseUrl) -> bool {
    if let Some(index) = self.copies.iter().position(|c| c.location() == location) {
      let was_primary = self.primary == Some(index);
      self.copies.remove(index);
      let shift = |i: usize| if i > index { i - 1 } else { i };
      self.local = match self.local {
        Some(l) if l == index => None,
        other => other.map(shift),
      };
      self.primary = if was_primary {
        // Prefer the local copy as the new primary.
        self.local.or(if self.copies.is_empty() { None } else { Some(0) })
      } else {
        self.primary.map(shift)
      };
    }
    !self.copies.is_empty()
  }

  pub fn remove_all_copies(&mut self) {
    self.copies.clear();
    self.primary = None;
    self.local = None;
  }

  /// Any copy to read from, the local one if there is one.
  pub fn get_a_copy(&self) -> Option<&R> {
    self.local_copy().or_else(|| self.primary_copy()).or_else(|| self.copies.first())
  }

  pub fn primary_copy(&self) -> Option<&R> {
    self.primary.map(|i| &self.copies[i])
  }

  pub fn local_copy(&self) -> Option<&R> {
    self.local.map(|i| &self.copies[i])
  }

  pub fn remove_local_copy(&mut self) -> bool {
    match self.local_copy().map(|c| c.location().clone()) {
      Some(location) => self.remove_copy(&location),
      None => !self.copies.is_empty(),
    }
  }

  pub fn all_copies(&self) -> &[R] {
    &self.copies
  }

  pub fn size(&self) -> usize {
    self.copies.len()
  }

  pub fn is_empty(&self) -> bool {
    self.copies.is_empty()
  }

  pub fn contains(&self, location: &DatabaseUrl) -> bool {
    self.copies.iter().any(|c| c.location() == location)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq)]
  struct Copy {
    location: DatabaseUrl,
    local: bool,
  }

  impl Replica for Copy {
    fn location(&self) -> &DatabaseUrl {
      &self.location
    }

    fn is_local(&self) -> bool {
      self.local
    }
  }

  fn copy(location: &str, local: bool) -> Copy {
    Copy { location: DatabaseUrl(location.to_string()), local }
  }

  fn url(s: &str) -> DatabaseUrl {
    DatabaseUrl(s.to_string())
  }

  fn assert_members<R: Replica>(set: &ReplicaSet<R>) {
    if let Some(primary) = set.primary_copy() {
      assert!(set.contains(primary.location()));
    }
    if let Some(local) = set.local_copy() {
      assert!(set.contains(local.location()));
      assert!(local.is_local());
    }
    assert_eq!(set.is_empty(), set.get_a_copy().is_none());
  }

  #[test]
  fn prefers_local_copy_test() {
    let mut set = ReplicaSet::new(TableName::parse("T"), copy("remote1", false));
    assert_eq!(set.get_a_copy().unwrap().location, url("remote1"));
    set.add_copy(copy("here", true));
    set.add_copy(copy("remote2", false));
    assert_eq!(set.get_a_copy().unwrap().location, url("here"));
    assert_eq!(set.primary_copy().unwrap().location, url("remote1"));
    assert_eq!(set.size(), 3);
    assert_members(&set);
  }

  #[test]
  fn remove_copy_test() {
    let mut set = ReplicaSet::new(TableName::parse("T"), copy("remote1", false));
    set.add_copy(copy("remote2", false));
    set.add_copy(copy("here", true));
    // Removing the primary promotes the local copy.
    assert!(set.remove_copy(&url("remote1")));
    assert_eq!(set.primary_copy().unwrap().location, url("here"));
    assert_members(&set);
    assert!(set.remove_local_copy());
    assert!(set.local_copy().is_none());
    assert_eq!(set.primary_copy().unwrap().location, url("remote2"));
    assert_members(&set);
    // Unknown locations leave the set alone.
    assert!(set.remove_copy(&url("nowhere")));
    // The last one goes.
    assert!(!set.remove_copy(&url("remote2")));
    assert!(set.get_a_copy().is_none());
    assert_members(&set);
  }

  #[test]
  fn indices_follow_removal_test() {
    let mut set = ReplicaSet::new(TableName::parse("T"), copy("a", false));
    set.add_copy(copy("b", false));
    set.add_copy(copy("here", true));
    assert!(set.remove_copy(&url("b")));
    assert_eq!(set.local_copy().unwrap().location, url("here"));
    assert_eq!(set.primary_copy().unwrap().location, url("a"));
    set.remove_all_copies();
    assert!(set.is_empty());
    assert_members(&set);
  }

  #[test]
  fn replace_copy_test() {
    let mut set = ReplicaSet::new(TableName::parse("T"), copy("a", false));
    set.add_copy(copy("a", true));
    assert_eq!(set.size(), 1);
    assert_eq!(set.local_copy().unwrap().location, url("a"));
  }
}
