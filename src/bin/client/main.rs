use clap::{arg, App};
use h2o::common::{mk_requester_id, DatabaseUrl, LocatorEndpoint};
use h2o::config::{DatabaseDescriptor, LocatorConfig, DEFAULT_LOCATOR_PORT};
use h2o::locator_client::{LocatorQuorumClient, TcpLocatorConnection};
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::process;

// A small admin shell over the Locator Service. Every command goes to all configured locators
// through the quorum client, exactly as a database instance would issue it.

fn prompt(name: &str) -> Option<String> {
  let mut line = String::new();
  print!("{}", name);
  std::io::stdout().flush().ok()?;
  match std::io::stdin().read_line(&mut line) {
    Ok(0) | Err(_) => None,
    Ok(_) => Some(line.trim().to_string()),
  }
}

fn locator_config(
  descriptor: Option<&str>,
  locators: Option<&str>,
) -> Result<LocatorConfig, String> {
  if let Some(path) = descriptor {
    let descriptor = DatabaseDescriptor::load(Path::new(path)).map_err(|e| e.to_string())?;
    return Ok(descriptor.locator_config());
  }
  let mut endpoints = Vec::new();
  for raw in locators.unwrap_or("localhost").split(',') {
    match LocatorEndpoint::parse(raw, DEFAULT_LOCATOR_PORT) {
      Some(endpoint) => endpoints.push(endpoint),
      None => return Err(format!("invalid locator endpoint: {}", raw)),
    }
  }
  Ok(LocatorConfig::new(endpoints))
}

fn main() {
  env_logger::init();

  // Setup CLI parsing
  let matches = App::new("h2o-client")
    .version("1.0")
    .author("Pasindu M. <pasindumuth@gmail.com>")
    .arg(arg!(-d --descriptor <FILE>).required(false).help("A database descriptor file."))
    .arg(arg!(-l --locators <LIST>).required(false).help("Comma-separated host:port list."))
    .arg(arg!(-n --name <URL>).required(false).help("The database instance to act as."))
    .get_matches();

  let config = match locator_config(matches.value_of("descriptor"), matches.value_of("locators")) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("{}", e);
      process::exit(1);
    }
  };
  let this_instance = DatabaseUrl(matches.value_of("name").unwrap_or("client").to_string());
  let mut client = LocatorQuorumClient::<TcpLocatorConnection>::connect(&config);
  // Create an RNG for requester ids
  let mut rand = XorShiftRng::from_entropy();

  // Setup the CLI read loop.
  while let Some(input) = prompt("> ") {
    let (command, rest) = match input.split_once(' ') {
      Some((command, rest)) => (command, rest.trim()),
      None => (input.as_str(), ""),
    };
    match command {
      "" => {}
      "exit" => break,
      "get" => match client.get_locations() {
        Ok(response) => {
          println!("update count {}: {:?}", response.update_count, response.locations)
        }
        Err(e) => println!("Error: {}", e),
      },
      "set" => {
        let locations: BTreeSet<String> = rest.split_whitespace().map(str::to_string).collect();
        println!("{}", client.set_locations(&locations));
      }
      "lock" => {
        let requester = if rest.is_empty() {
          mk_requester_id(&mut rand, &this_instance)
        } else {
          rest.to_string()
        };
        match client.lock_locators(&requester) {
          Ok(granted) => println!("{} (requester {})", granted, requester),
          Err(e) => println!("Error: {}", e),
        }
      }
      "commit" => println!("{}", client.commit_locators(rest)),
      "claim" => {
        let location = if rest.is_empty() { this_instance.0.clone() } else { rest.to_string() };
        let requester = mk_requester_id(&mut rand, &this_instance);
        match client.claim_system_table(&requester, &location) {
          Ok(claimed) => println!("{}", claimed),
          Err(e) => println!("Error: {}", e),
        }
      }
      _ => println!("Unknown command: {}", command),
    }
  }
}
