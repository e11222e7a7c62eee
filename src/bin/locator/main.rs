use clap::{arg, App};
use h2o::common::SystemClock;
use h2o::config::{LocatorServerConfig, DEFAULT_LOCATOR_PORT};
use h2o::locator_server::{open_register, start_locator_server};
use log::error;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

// The locator keeps the cluster's record of where the System Table lives. Run one on each of
// the hosts named in the `locatorLocations` of the database descriptor.

fn main() {
  env_logger::init();

  // Setup CLI parsing
  let matches = App::new("h2o-locator")
    .version("1.0")
    .author("Pasindu M. <pasindumuth@gmail.com>")
    .arg(arg!(-b --bind <HOST>).required(false).help("The address to listen on."))
    .arg(arg!(-p --port <PORT>).required(false).help("The port to listen on."))
    .arg(arg!(-s --state <FILE>).required(false).help("Where to persist the register."))
    .arg(
      arg!(-t --"lock-timeout" <MILLIS>)
        .required(false)
        .help("How long a creation lock is honoured before it is taken over."),
    )
    .get_matches();

  let mut config = LocatorServerConfig::default();
  if let Some(bind) = matches.value_of("bind") {
    config.bind_host = bind.to_string();
  }
  config.port = match matches.value_of("port").map(str::parse::<u16>) {
    None => DEFAULT_LOCATOR_PORT,
    Some(Ok(port)) => port,
    Some(Err(e)) => exit_with(&format!("Invalid port: {}", e)),
  };
  config.state_file = matches.value_of("state").map(PathBuf::from);
  if let Some(millis) = matches.value_of("lock-timeout") {
    match millis.parse::<u64>() {
      Ok(millis) => config.lock_timeout = Duration::from_millis(millis),
      Err(e) => exit_with(&format!("Invalid lock timeout: {}", e)),
    }
  }

  let register = match open_register(&config, Arc::new(SystemClock::default())) {
    Ok(register) => register,
    Err(e) => exit_with(&format!("Could not open the locator register: {}", e)),
  };
  match start_locator_server(&config, register) {
    Ok(handle) => handle.wait(),
    Err(e) => exit_with(&format!("Could not start the locator server: {}", e)),
  }
}

fn exit_with(message: &str) -> ! {
  error!("{}", message);
  eprintln!("{}", message);
  process::exit(1)
}
