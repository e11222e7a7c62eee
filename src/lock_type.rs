use crate::common::{DatabaseUrl, RequestId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------------------------
//  LockType
// -----------------------------------------------------------------------------------------------

/// The kind of grant a Table Manager hands out for a table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockType {
  Create,
  Write,
  Read,
  /// Write-level exclusivity for a destructive structural change.
  Drop,
  None,
}

impl LockType {
  pub fn is_exclusive(&self) -> bool {
    match self {
      LockType::Create | LockType::Write | LockType::Drop => true,
      LockType::Read | LockType::None => false,
    }
  }

  /// Whether holding `self` is enough to do what needs `required`.
  pub fn satisfies(&self, required: LockType) -> bool {
    match (self, required) {
      (_, LockType::None) => true,
      (LockType::None, _) => false,
      (LockType::Read, LockType::Read) => true,
      (LockType::Read, _) => false,
      // Creating a table is its own grant, nothing else stands in for it.
      (LockType::Create, LockType::Create) => true,
      (_, LockType::Create) => false,
      (LockType::Drop, _) => true,
      (LockType::Write, LockType::Drop) => false,
      (LockType::Write, _) => true,
      (LockType::Create, _) => true,
    }
  }
}

// -----------------------------------------------------------------------------------------------
//  LockRequest
// -----------------------------------------------------------------------------------------------

/// The party a distributed lock is requested for: a session on some database instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionDescriptor {
  pub database: DatabaseUrl,
  pub session_id: SessionId,
  pub auto_commit: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
  request_id: RequestId,
  session: SessionDescriptor,
  lock_type: LockType,
  created_at: Timestamp,
}

impl LockRequest {
  pub fn new(
    request_id: RequestId,
    session: SessionDescriptor,
    lock_type: LockType,
    created_at: Timestamp,
  ) -> LockRequest {
    LockRequest { request_id, session, lock_type, created_at }
  }

  pub fn request_id(&self) -> RequestId {
    self.request_id
  }

  pub fn session(&self) -> &SessionDescriptor {
    &self.session
  }

  pub fn lock_type(&self) -> LockType {
    self.lock_type
  }

  pub fn created_at(&self) -> Timestamp {
    self.created_at
  }
}

// -----------------------------------------------------------------------------------------------
//  StatementKind
// -----------------------------------------------------------------------------------------------

/// The statements that go through the distributed lock protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
  Create,
  CreateReplica,
  Insert,
  Update,
  Delete,
  Select,
  Drop,
}

impl StatementKind {
  pub fn required_lock_type(&self) -> LockType {
    match self {
      StatementKind::Create => LockType::Create,
      StatementKind::CreateReplica => LockType::Write,
      StatementKind::Insert | StatementKind::Update | StatementKind::Delete => LockType::Write,
      StatementKind::Select => LockType::Read,
      StatementKind::Drop => LockType::Drop,
    }
  }

  /// Statements that change the table and so must reach every replica.
  pub fn is_update(&self) -> bool {
    *self != StatementKind::Select
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn satisfies_test() {
    assert!(LockType::Read.satisfies(LockType::Read));
    assert!(!LockType::Read.satisfies(LockType::Write));
    assert!(LockType::Write.satisfies(LockType::Read));
    assert!(LockType::Write.satisfies(LockType::Write));
    assert!(!LockType::Write.satisfies(LockType::Drop));
    assert!(LockType::Drop.satisfies(LockType::Write));
    assert!(LockType::Drop.satisfies(LockType::Read));
    assert!(!LockType::Drop.satisfies(LockType::Create));
    assert!(LockType::Create.satisfies(LockType::Write));
    assert!(!LockType::None.satisfies(LockType::Read));
    assert!(LockType::None.satisfies(LockType::None));
  }

  #[test]
  fn required_lock_type_test() {
    assert_eq!(StatementKind::Select.required_lock_type(), LockType::Read);
    assert_eq!(StatementKind::Delete.required_lock_type(), LockType::Write);
    assert_eq!(StatementKind::Drop.required_lock_type(), LockType::Drop);
    assert!(StatementKind::Drop.required_lock_type().is_exclusive());
    assert!(!StatementKind::Select.is_update());
  }
}
