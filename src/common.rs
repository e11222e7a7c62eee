use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// -----------------------------------------------------------------------------------------------
//  Time
// -----------------------------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u128);

impl Timestamp {
  /// Milliseconds elapsed from `earlier` to `self`, saturating at 0 if the clock went
  /// backwards.
  pub fn millis_since(&self, earlier: Timestamp) -> u128 {
    self.0.saturating_sub(earlier.0)
  }
}

pub trait Clock: Send + Sync {
  fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock {}

impl Clock for SystemClock {
  fn now(&self) -> Timestamp {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
      Ok(elapsed) => Timestamp(elapsed.as_millis()),
      // A clock set before 1970 is treated as the epoch itself.
      Err(_) => Timestamp(0),
    }
  }
}

/// A clock that only moves when told to. Used to drive lock expiry deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
  millis: AtomicU64,
}

impl ManualClock {
  pub fn new(start: u64) -> ManualClock {
    ManualClock { millis: AtomicU64::new(start) }
  }

  pub fn advance(&self, millis: u64) {
    self.millis.fetch_add(millis, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Timestamp {
    Timestamp(self.millis.load(Ordering::SeqCst) as u128)
  }
}

// -----------------------------------------------------------------------------------------------
//  Identifiers
// -----------------------------------------------------------------------------------------------

/// Identifies a session of the local database engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "session#{}", self.0)
  }
}

/// The name of a logical transaction. A transaction that calls out to another instance and
/// comes back in does so under the same `TransactionName`, but on a different session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionName(pub String);

/// The location of a database instance, and hence of any replica it hosts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatabaseUrl(pub String);

impl fmt::Display for DatabaseUrl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identifies a distributed lock request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

pub fn mk_rid<R: Rng>(rng: &mut R) -> RequestId {
  RequestId(rng.gen())
}

/// Builds the requester id a database instance presents to the locators when it tries to
/// take the System Table creation lock. The random suffix tells apart two attempts made by
/// the same instance.
pub fn mk_requester_id<R: Rng>(rng: &mut R, instance: &DatabaseUrl) -> String {
  format!("{}#{:016x}", instance.0, rng.gen::<u64>())
}

/// The schema holding the cluster's own management tables.
pub const INTERNAL_SCHEMA: &str = "H2O";
pub const INFORMATION_SCHEMA: &str = "INFORMATION_SCHEMA";

/// A fully qualified table name, `schema.name`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName {
  pub schema: String,
  pub name: String,
}

impl TableName {
  pub fn new(schema: &str, name: &str) -> TableName {
    TableName { schema: schema.to_uppercase(), name: name.to_uppercase() }
  }

  /// Parses `schema.name`, defaulting the schema to `PUBLIC`.
  pub fn parse(qualified: &str) -> TableName {
    match qualified.split_once('.') {
      Some((schema, name)) => TableName::new(schema, name),
      None => TableName::new("PUBLIC", qualified),
    }
  }

  /// Regular tables are user tables. Their updates are propagated to every replica, whereas
  /// internal and management tables only ever change on the local instance.
  pub fn is_regular(&self) -> bool {
    self.schema != INTERNAL_SCHEMA && self.schema != INFORMATION_SCHEMA
  }
}

impl fmt::Display for TableName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.schema, self.name)
  }
}

/// The address of a locator server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocatorEndpoint {
  pub host: String,
  pub port: u16,
}

impl LocatorEndpoint {
  /// Parses `host:port`. A missing port means the default locator port.
  pub fn parse(s: &str, default_port: u16) -> Option<LocatorEndpoint> {
    let s = s.trim();
    if s.is_empty() {
      return None;
    }
    match s.rsplit_once(':') {
      Some((host, port)) => {
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
          None
        } else {
          Some(LocatorEndpoint { host: host.to_string(), port })
        }
      }
      None => Some(LocatorEndpoint { host: s.to_string(), port: default_port }),
    }
  }
}

impl fmt::Display for LocatorEndpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

// -----------------------------------------------------------------------------------------------
//  Quorum
// -----------------------------------------------------------------------------------------------

pub fn majority(n: usize) -> usize {
  n / 2 + 1
}

/// Whether `successes` out of `n` participants is a strict majority.
pub fn has_achieved_majority(successes: usize, n: usize) -> bool {
  successes >= majority(n)
}
