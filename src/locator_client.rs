use crate::common::{has_achieved_majority, LocatorEndpoint};
use crate::config::LocatorConfig;
use crate::locator_protocol::{
  lock_reply_byte, read_flag, read_get_reply, read_lock_reply, write_request, LocatorError,
  LocatorRequest, LocatorResponse,
};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufReader;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

#[cfg(test)]
#[path = "test/locator_client_test.rs"]
mod locator_client_test;

// -----------------------------------------------------------------------------------------------
//  LocatorConnection
// -----------------------------------------------------------------------------------------------

/// A single locator server, as seen by a database instance.
pub trait LocatorConnection {
  fn endpoint(&self) -> &LocatorEndpoint;
  fn get(&mut self) -> Result<LocatorResponse, LocatorError>;
  fn set(&mut self, locations: &BTreeSet<String>) -> Result<bool, LocatorError>;
  /// Returns the low byte of the locator's update count if the lock was granted, 0
  /// otherwise.
  fn lock(&mut self, requester: &str) -> Result<u8, LocatorError>;
  fn commit(&mut self, requester: &str) -> Result<bool, LocatorError>;
}

/// Talks to a locator over TCP, one connection per request.
#[derive(Debug, Clone)]
pub struct TcpLocatorConnection {
  endpoint: LocatorEndpoint,
  timeout: Duration,
}

impl TcpLocatorConnection {
  pub fn new(endpoint: LocatorEndpoint, timeout: Duration) -> TcpLocatorConnection {
    TcpLocatorConnection { endpoint, timeout }
  }

  /// Connects, sends `request`, and half-closes the write side so the server sees the whole
  /// request.
  fn send(&self, request: &LocatorRequest) -> Result<TcpStream, LocatorError> {
    let mut addrs = (self.endpoint.host.as_str(), self.endpoint.port).to_socket_addrs()?;
    let addr = match addrs.next() {
      Some(addr) => addr,
      None => {
        return Err(LocatorError::Protocol(format!("{} does not resolve", self.endpoint)));
      }
    };
    let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
    stream.set_read_timeout(Some(self.timeout))?;
    stream.set_write_timeout(Some(self.timeout))?;
    write_request(&mut stream, request)?;
    stream.shutdown(Shutdown::Write)?;
    Ok(stream)
  }
}

impl LocatorConnection for TcpLocatorConnection {
  fn endpoint(&self) -> &LocatorEndpoint {
    &self.endpoint
  }

  fn get(&mut self) -> Result<LocatorResponse, LocatorError> {
    let stream = self.send(&LocatorRequest::Get)?;
    read_get_reply(&mut BufReader::new(stream))
  }

  fn set(&mut self, locations: &BTreeSet<String>) -> Result<bool, LocatorError> {
    let mut stream = self.send(&LocatorRequest::Set(locations.clone()))?;
    read_flag(&mut stream)
  }

  fn lock(&mut self, requester: &str) -> Result<u8, LocatorError> {
    let mut stream = self.send(&LocatorRequest::Lock(requester.to_string()))?;
    read_lock_reply(&mut stream)
  }

  fn commit(&mut self, requester: &str) -> Result<bool, LocatorError> {
    let mut stream = self.send(&LocatorRequest::Commit(requester.to_string()))?;
    read_flag(&mut stream)
  }
}

// -----------------------------------------------------------------------------------------------
//  LocatorQuorumClient
// -----------------------------------------------------------------------------------------------

/// Works out where the System Table is from a set of locators that may disagree or be down,
/// and drives the LOCK / create / COMMIT sequence for making a new System Table.
///
/// A locator that can't be reached simply doesn't vote. It still counts towards the number
/// of locators a majority is computed over.
pub struct LocatorQuorumClient<C: LocatorConnection> {
  connections: Vec<C>,
  minimum_locators: usize,
  /// The update count each locator reported in its last GET.
  observed_counts: BTreeMap<LocatorEndpoint, u32>,
}

impl LocatorQuorumClient<TcpLocatorConnection> {
  pub fn connect(config: &LocatorConfig) -> LocatorQuorumClient<TcpLocatorConnection> {
    let connections = config
      .endpoints
      .iter()
      .map(|e| TcpLocatorConnection::new(e.clone(), config.socket_timeout))
      .collect();
    LocatorQuorumClient::new(connections, config.minimum_locators)
  }
}

impl<C: LocatorConnection> LocatorQuorumClient<C> {
  pub fn new(connections: Vec<C>, minimum_locators: usize) -> LocatorQuorumClient<C> {
    LocatorQuorumClient { connections, minimum_locators, observed_counts: BTreeMap::new() }
  }

  pub fn num_locators(&self) -> usize {
    self.connections.len()
  }

  pub fn observed_count(&self, endpoint: &LocatorEndpoint) -> Option<u32> {
    self.observed_counts.get(endpoint).cloned()
  }

  /// Asks every locator where the System Table is, and returns the answer a majority agrees
  /// on.
  ///
  /// The first answer that repeats an earlier one is returned straight away, without asking
  /// the remaining locators. With more than 3 locators this can settle on an answer that only
  /// a minority holds.
  pub fn get_locations(&mut self) -> Result<LocatorResponse, LocatorError> {
    let configured = self.connections.len();
    let mut responses = Vec::<LocatorResponse>::new();
    for conn in &mut self.connections {
      match conn.get() {
        Ok(response) => {
          debug!("Locator {} reports {:?}", conn.endpoint(), response);
          self.observed_counts.insert(conn.endpoint().clone(), response.update_count);
          if responses.contains(&response) || configured == 1 {
            return Ok(response);
          }
          responses.push(response);
        }
        Err(e) => warn!("Locator {} did not answer GET: {}", conn.endpoint(), e),
      }
    }

    // No early agreement, so count every response class.
    let mut tally = BTreeMap::<usize, usize>::new();
    for (i, response) in responses.iter().enumerate() {
      let first = responses.iter().position(|r| r == response).unwrap_or(i);
      *tally.entry(first).or_insert(0) += 1;
    }
    let best = tally.iter().max_by_key(|(_, count)| **count);
    if let Some((index, count)) = best {
      if has_achieved_majority(*count, configured) {
        return Ok(responses[*index].clone());
      }
    }
    Err(LocatorError::NoMajority { responded: responses.len(), configured })
  }

  /// Replaces the location set on every locator. Succeeds if a majority acknowledged.
  pub fn set_locations(&mut self, locations: &BTreeSet<String>) -> bool {
    let mut acks = 0;
    for conn in &mut self.connections {
      match conn.set(locations) {
        Ok(true) => acks += 1,
        Ok(false) => warn!("Locator {} refused SET", conn.endpoint()),
        Err(e) => warn!("Locator {} did not answer SET: {}", conn.endpoint(), e),
      }
    }
    has_achieved_majority(acks, self.connections.len())
  }

  /// Takes the creation lock on every locator. Succeeds if a majority granted it and each of
  /// them still had the update count seen by the last `get_locations`. A locator whose state
  /// moved on since then doesn't count, since someone else has changed the System Table.
  pub fn lock_locators(&mut self, requester: &str) -> Result<bool, LocatorError> {
    let configured = self.connections.len();
    if configured < self.minimum_locators {
      return Err(LocatorError::NotEnoughLocators {
        configured,
        minimum: self.minimum_locators,
      });
    }

    let mut granted = 0;
    for conn in &mut self.connections {
      match conn.lock(requester) {
        Ok(0) => debug!("Locator {} denied LOCK to {}", conn.endpoint(), requester),
        Ok(count) => {
          let observed = self.observed_counts.get(conn.endpoint()).map(|c| lock_reply_byte(*c));
          if observed == Some(count) {
            granted += 1;
          } else {
            info!(
              "Locator {} granted LOCK at update count {}, but {:?} was observed",
              conn.endpoint(),
              count,
              observed
            );
          }
        }
        Err(e) => warn!("Locator {} did not answer LOCK: {}", conn.endpoint(), e),
      }
    }
    Ok(has_achieved_majority(granted, configured))
  }

  /// Releases the creation lock everywhere, bumping each locator's update count.
  pub fn commit_locators(&mut self, requester: &str) -> bool {
    let mut acks = 0;
    for conn in &mut self.connections {
      match conn.commit(requester) {
        Ok(true) => acks += 1,
        Ok(false) => warn!("Locator {} refused COMMIT from {}", conn.endpoint(), requester),
        Err(e) => warn!("Locator {} did not answer COMMIT: {}", conn.endpoint(), e),
      }
    }
    has_achieved_majority(acks, self.connections.len())
  }

  /// Registers `location` as the home of a brand new System Table. The caller must already
  /// have created the System Table at `location`, or must do so only if this returns true.
  ///
  /// Returns false if another instance holds the creation lock or changed the register
  /// concurrently; the caller should then look the System Table up again.
  ///
  /// If SET fails after the lock was taken, the lock is still released with COMMIT, which
  /// bumps the update count of every locator that accepts it although the locations did
  /// not change. Counts observed by other instances before that go stale, so their next
  /// `lock_locators` fails until they call `get_locations` again.
  pub fn claim_system_table(
    &mut self,
    requester: &str,
    location: &str,
  ) -> Result<bool, LocatorError> {
    // Observe the current counts first, so that LOCK can check nothing moved in between.
    match self.get_locations() {
      Ok(_) | Err(LocatorError::NoMajority { .. }) => {}
      Err(e) => return Err(e),
    }
    if !self.lock_locators(requester)? {
      info!("Could not lock a majority of locators for {}", requester);
      return Ok(false);
    }
    let locations: BTreeSet<String> = vec![location.to_string()].into_iter().collect();
    if !self.set_locations(&locations) {
      warn!("Could not record System Table location {} on a majority", location);
      // Release whatever we hold; a lock we can't release expires by itself.
      self.commit_locators(requester);
      return Ok(false);
    }
    Ok(self.commit_locators(requester))
  }
}
