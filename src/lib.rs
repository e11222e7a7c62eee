pub mod common;
pub mod config;
pub mod deadlock;
pub mod locator_client;
pub mod locator_protocol;
pub mod locator_server;
pub mod locator_state;
pub mod lock_log;
pub mod lock_manager;
pub mod lock_type;
pub mod replica_set;
pub mod system_table;
pub mod table_manager;
pub mod table_proxy;
pub mod table_proxy_manager;
