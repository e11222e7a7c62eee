use crate::common::{LocatorEndpoint, TableName, INTERNAL_SCHEMA};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

// -----------------------------------------------------------------------------------------------
//  Defaults
// -----------------------------------------------------------------------------------------------

pub const DEFAULT_LOCATOR_PORT: u16 = 29999;

/// A locator creation lock older than this is considered abandoned.
pub const LOCK_TIMEOUT_MS: u64 = 3000;

/// How often a blocked table lock wakes up to check for deadlocks.
pub const DEADLOCK_CHECK_MS: u64 = 100;

pub const MINIMUM_NUMBER_OF_LOCATOR_SERVERS: usize = 1;

pub const DEFAULT_SESSION_LOCK_TIMEOUT_MS: u64 = 2000;

/// How long the locator accept loop sleeps when there is no pending connection.
pub const ACCEPT_POLL_MS: u64 = 50;

/// Read/write timeout on a single locator request.
pub const LOCATOR_SOCKET_TIMEOUT_MS: u64 = 5000;

/// The name of the System Table, the catalog of Table Managers.
pub const SYSTEM_TABLE_NAME: &str = "H2O_TABLE";

// -----------------------------------------------------------------------------------------------
//  Configs
// -----------------------------------------------------------------------------------------------

/// Configuration of the client side of the Locator Service.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
  pub endpoints: Vec<LocatorEndpoint>,
  pub socket_timeout: Duration,
  pub minimum_locators: usize,
}

impl LocatorConfig {
  pub fn new(endpoints: Vec<LocatorEndpoint>) -> LocatorConfig {
    LocatorConfig {
      endpoints,
      socket_timeout: Duration::from_millis(LOCATOR_SOCKET_TIMEOUT_MS),
      minimum_locators: MINIMUM_NUMBER_OF_LOCATOR_SERVERS,
    }
  }
}

/// Configuration of one `LockRegisterServer`.
#[derive(Debug, Clone)]
pub struct LocatorServerConfig {
  pub bind_host: String,
  pub port: u16,
  /// Where the register is persisted. `None` keeps it in memory only.
  pub state_file: Option<PathBuf>,
  pub accept_poll: Duration,
  pub lock_timeout: Duration,
}

impl Default for LocatorServerConfig {
  fn default() -> LocatorServerConfig {
    LocatorServerConfig {
      bind_host: "0.0.0.0".to_string(),
      port: DEFAULT_LOCATOR_PORT,
      state_file: None,
      accept_poll: Duration::from_millis(ACCEPT_POLL_MS),
      lock_timeout: Duration::from_millis(LOCK_TIMEOUT_MS),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Table locks are only taken when forced.
  Off,
  Table,
}

/// Configuration of the local table lock manager of one database.
#[derive(Debug, Clone)]
pub struct LockConfig {
  pub deadlock_check: Duration,
  pub default_lock_timeout: Duration,
  pub lock_mode: LockMode,
  /// The only table whose lock may be re-entered by another session of the same transaction.
  pub catalog_table: TableName,
  /// How many events the lock log keeps per table.
  pub event_log_capacity: usize,
}

impl Default for LockConfig {
  fn default() -> LockConfig {
    LockConfig {
      deadlock_check: Duration::from_millis(DEADLOCK_CHECK_MS),
      default_lock_timeout: Duration::from_millis(DEFAULT_SESSION_LOCK_TIMEOUT_MS),
      lock_mode: LockMode::Table,
      catalog_table: TableName::new(INTERNAL_SCHEMA, SYSTEM_TABLE_NAME),
      event_log_capacity: 64,
    }
  }
}

// -----------------------------------------------------------------------------------------------
//  Descriptor File
// -----------------------------------------------------------------------------------------------

/// The database descriptor: a properties file that tells an instance where the locators are.
///
/// ```text
/// # comment
/// databaseName=shop
/// locatorLocations=db1:29999,db2:29999,db3
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDescriptor {
  pub database_name: Option<String>,
  pub locators: Vec<LocatorEndpoint>,
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
  #[error("could not read descriptor: {0}")]
  Io(#[from] io::Error),
  #[error("malformed descriptor line {line}: {content}")]
  Malformed { line: usize, content: String },
  #[error("invalid locator endpoint: {0}")]
  BadEndpoint(String),
  #[error("descriptor does not list any locators")]
  NoLocators,
}

impl DatabaseDescriptor {
  pub fn load(path: &Path) -> Result<DatabaseDescriptor, DescriptorError> {
    let text = fs::read_to_string(path)?;
    DatabaseDescriptor::parse(&text)
  }

  pub fn parse(text: &str) -> Result<DatabaseDescriptor, DescriptorError> {
    let mut props = BTreeMap::<String, String>::new();
    for (i, line) in text.lines().enumerate() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        continue;
      }
      match line.split_once('=') {
        Some((k, v)) => {
          props.insert(k.trim().to_string(), v.trim().to_string());
        }
        None => {
          return Err(DescriptorError::Malformed { line: i + 1, content: line.to_string() });
        }
      }
    }

    let mut locators = Vec::new();
    if let Some(list) = props.get("locatorLocations") {
      for raw in list.split(',').filter(|s| !s.trim().is_empty()) {
        match LocatorEndpoint::parse(raw, DEFAULT_LOCATOR_PORT) {
          Some(endpoint) => locators.push(endpoint),
          None => return Err(DescriptorError::BadEndpoint(raw.trim().to_string())),
        }
      }
    }
    if locators.is_empty() {
      return Err(DescriptorError::NoLocators);
    }

    Ok(DatabaseDescriptor { database_name: props.get("databaseName").cloned(), locators })
  }

  pub fn locator_config(&self) -> LocatorConfig {
    LocatorConfig::new(self.locators.clone())
  }
}
