use byteorder::{ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::io::{BufRead, Read, Write};

// -----------------------------------------------------------------------------------------------
//  Locator Wire Protocol
// -----------------------------------------------------------------------------------------------
// Every request is a command line followed by payload lines and a terminating `END` line:
//
//   GET\nEND\n                    -> <updateCount>\n(<location>\n)*
//   SET\n(<location>\n)*END\n     -> 1 byte: 1 | 0
//   LOCK\n<requesterId>\nEND\n    -> 1 byte: low byte of updateCount if granted | 0
//   COMMIT\n<requesterId>\nEND\n  -> 1 byte: 1 | 0
//
// One request is served per connection, after which the server closes it.

pub const END: &str = "END";

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
  #[error("locator i/o error: {0}")]
  Io(#[from] io::Error),
  #[error("locator protocol error: {0}")]
  Protocol(String),
  #[error("could not encode locator state: {0}")]
  Encode(#[from] rmp_serde::encode::Error),
  #[error("could not decode locator state: {0}")]
  Decode(#[from] rmp_serde::decode::Error),
  #[error("no majority among locators ({responded} of {configured} responded)")]
  NoMajority { responded: usize, configured: usize },
  #[error("{configured} locators configured, at least {minimum} required")]
  NotEnoughLocators { configured: usize, minimum: usize },
}

impl LocatorError {
  /// Whether this error means the System Table location can't be established, which
  /// blocks startup of the instance rather than failing a single query.
  pub fn is_startup_blocking(&self) -> bool {
    match self {
      LocatorError::NoMajority { .. } | LocatorError::NotEnoughLocators { .. } => true,
      _ => false,
    }
  }
}

fn protocol_err<T>(msg: String) -> Result<T, LocatorError> {
  Err(LocatorError::Protocol(msg))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorRequest {
  Get,
  Set(BTreeSet<String>),
  Lock(String),
  Commit(String),
}

/// A locator's view of where the System Table lives. Two responses are the same vote
/// exactly when both the counter and the location set agree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LocatorResponse {
  pub update_count: u32,
  pub locations: BTreeSet<String>,
}

// -----------------------------------------------------------------------------------------------
//  Requests
// -----------------------------------------------------------------------------------------------

pub fn write_request<W: Write>(w: &mut W, request: &LocatorRequest) -> io::Result<()> {
  let mut text = String::new();
  match request {
    LocatorRequest::Get => text.push_str("GET\n"),
    LocatorRequest::Set(locations) => {
      text.push_str("SET\n");
      for location in locations {
        text.push_str(location);
        text.push('\n');
      }
    }
    LocatorRequest::Lock(requester) => text.push_str(&format!("LOCK\n{}\n", requester)),
    LocatorRequest::Commit(requester) => text.push_str(&format!("COMMIT\n{}\n", requester)),
  }
  text.push_str(END);
  text.push('\n');
  w.write_all(text.as_bytes())?;
  w.flush()
}

/// Reads one line without its terminator. `None` means the peer closed the stream.
fn read_line<R: BufRead>(r: &mut R) -> Result<Option<String>, LocatorError> {
  let mut line = String::new();
  if r.read_line(&mut line)? == 0 {
    return Ok(None);
  }
  while line.ends_with('\n') || line.ends_with('\r') {
    line.pop();
  }
  Ok(Some(line))
}

pub fn read_request<R: BufRead>(r: &mut R) -> Result<LocatorRequest, LocatorError> {
  let command = match read_line(r)? {
    Some(command) => command,
    None => return protocol_err("connection closed before a request".to_string()),
  };

  // Read the payload up to the END line.
  let mut payload = Vec::<String>::new();
  loop {
    match read_line(r)? {
      Some(line) if line == END => break,
      Some(line) => payload.push(line),
      None => return protocol_err(format!("{} request is missing {}", command, END)),
    }
  }

  match command.as_str() {
    "GET" => {
      if !payload.is_empty() {
        return protocol_err("GET takes no payload".to_string());
      }
      Ok(LocatorRequest::Get)
    }
    "SET" => Ok(LocatorRequest::Set(payload.into_iter().filter(|l| !l.is_empty()).collect())),
    "LOCK" | "COMMIT" => {
      if payload.len() != 1 || payload[0].is_empty() {
        return protocol_err(format!("{} takes exactly one requester id", command));
      }
      let requester = payload.remove(0);
      if command == "LOCK" {
        Ok(LocatorRequest::Lock(requester))
      } else {
        Ok(LocatorRequest::Commit(requester))
      }
    }
    other => protocol_err(format!("unknown command {:?}", other)),
  }
}

// -----------------------------------------------------------------------------------------------
//  Replies
// -----------------------------------------------------------------------------------------------

pub fn write_get_reply<W: Write>(w: &mut W, response: &LocatorResponse) -> io::Result<()> {
  let mut text = format!("{}\n", response.update_count);
  for location in &response.locations {
    text.push_str(location);
    text.push('\n');
  }
  w.write_all(text.as_bytes())?;
  w.flush()
}

/// Reads a GET reply until the server closes the connection.
pub fn read_get_reply<R: BufRead>(r: &mut R) -> Result<LocatorResponse, LocatorError> {
  let update_count = match read_line(r)? {
    Some(line) => match line.trim().parse::<u32>() {
      Ok(count) => count,
      Err(_) => return protocol_err(format!("bad update count {:?}", line)),
    },
    None => return protocol_err("empty GET reply".to_string()),
  };
  let mut locations = BTreeSet::new();
  while let Some(line) = read_line(r)? {
    if !line.is_empty() {
      locations.insert(line);
    }
  }
  Ok(LocatorResponse { update_count, locations })
}

pub fn write_flag<W: Write>(w: &mut W, flag: bool) -> io::Result<()> {
  w.write_u8(if flag { 1 } else { 0 })?;
  w.flush()
}

pub fn read_flag<R: Read>(r: &mut R) -> Result<bool, LocatorError> {
  match r.read_u8()? {
    0 => Ok(false),
    1 => Ok(true),
    other => protocol_err(format!("bad flag byte {}", other)),
  }
}

/// The byte a granted LOCK answers with. Counts past 255 wrap, and a count whose low byte is
/// 0 reads as a denial.
pub fn lock_reply_byte(update_count: u32) -> u8 {
  (update_count & 0xff) as u8
}

pub fn write_lock_reply<W: Write>(w: &mut W, update_count: u32) -> io::Result<()> {
  w.write_u8(lock_reply_byte(update_count))?;
  w.flush()
}

pub fn read_lock_reply<R: Read>(r: &mut R) -> Result<u8, LocatorError> {
  Ok(r.read_u8()?)
}
