use crate::common::Clock;
use crate::config::LocatorServerConfig;
use crate::locator_protocol::{
  read_request, write_flag, write_get_reply, write_lock_reply, LocatorError,
};
use crate::locator_state::{LocatorReply, LockRegisterState, SharedLockRegister};
use log::{debug, info, warn};
use std::io::{BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(test)]
#[path = "test/locator_server_test.rs"]
mod locator_server_test;

/// How long a worker waits on a silent client before giving up on the connection.
const WORKER_READ_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------------------------
//  LockRegisterServer
// -----------------------------------------------------------------------------------------------
// The threading model is simple: one Accepting Thread, and one Worker Thread per accepted
// connection. The Accepting Thread polls a non-blocking listener, sleeping for `accept_poll`
// between attempts, so that it notices a shutdown request promptly. Each Worker reads one
// request, answers it against the `SharedLockRegister`, and closes the connection.

pub struct LocatorServerHandle {
  local_addr: SocketAddr,
  register: Arc<SharedLockRegister>,
  shutdown: Arc<AtomicBool>,
  accept_thread: Option<JoinHandle<()>>,
}

impl LocatorServerHandle {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn register(&self) -> &Arc<SharedLockRegister> {
    &self.register
  }

  /// Stops accepting connections and waits for the Accepting Thread to exit. Workers that
  /// are mid-request finish on their own.
  pub fn shutdown(&mut self) {
    self.shutdown.store(true, Ordering::SeqCst);
    if let Some(accept_thread) = self.accept_thread.take() {
      if accept_thread.join().is_err() {
        warn!("Locator accept thread on {} panicked", self.local_addr);
      }
      info!("Locator server on {} stopped", self.local_addr);
    }
  }

  /// Blocks until the server is shut down from another thread.
  pub fn wait(mut self) {
    if let Some(accept_thread) = self.accept_thread.take() {
      let _ = accept_thread.join();
    }
  }
}

impl Drop for LocatorServerHandle {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Builds the register described by `config`, loading its state file if there is one.
pub fn open_register(
  config: &LocatorServerConfig,
  clock: Arc<dyn Clock>,
) -> Result<SharedLockRegister, LocatorError> {
  let state = match &config.state_file {
    Some(path) => LockRegisterState::open(path, config.lock_timeout)?,
    None => LockRegisterState::new(config.lock_timeout),
  };
  Ok(SharedLockRegister::new(state, clock))
}

/// Binds the listener and starts the Accepting Thread.
pub fn start_locator_server(
  config: &LocatorServerConfig,
  register: SharedLockRegister,
) -> Result<LocatorServerHandle, LocatorError> {
  let listener = TcpListener::bind((config.bind_host.as_str(), config.port))?;
  listener.set_nonblocking(true)?;
  let local_addr = listener.local_addr()?;
  info!("Locator server listening on {}", local_addr);

  let register = Arc::new(register);
  let shutdown = Arc::new(AtomicBool::new(false));
  let accept_thread = {
    let register = register.clone();
    let shutdown = shutdown.clone();
    let accept_poll = config.accept_poll;
    thread::Builder::new()
      .name(format!("locator-accept-{}", local_addr.port()))
      .spawn(move || accept_loop(listener, register, shutdown, accept_poll))?
  };

  Ok(LocatorServerHandle { local_addr, register, shutdown, accept_thread: Some(accept_thread) })
}

fn accept_loop(
  listener: TcpListener,
  register: Arc<SharedLockRegister>,
  shutdown: Arc<AtomicBool>,
  accept_poll: Duration,
) {
  while !shutdown.load(Ordering::SeqCst) {
    match listener.accept() {
      Ok((stream, peer)) => {
        let register = register.clone();
        let spawned = thread::Builder::new()
          .name("locator-worker".to_string())
          .spawn(move || serve_connection(stream, peer, &register));
        if let Err(e) = spawned {
          warn!("Could not start a worker for {}: {}", peer, e);
        }
      }
      Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(accept_poll),
      Err(e) => {
        warn!("Locator accept failed: {}", e);
        thread::sleep(accept_poll);
      }
    }
  }
}

fn serve_connection(stream: TcpStream, peer: SocketAddr, register: &SharedLockRegister) {
  if let Err(e) = handle_request(&stream, register) {
    // The connection is dropped without an answer; the client has to reconnect.
    warn!("Closing locator connection from {}: {}", peer, e);
  }
}

fn handle_request(stream: &TcpStream, register: &SharedLockRegister) -> Result<(), LocatorError> {
  // Accepted sockets may inherit the listener's non-blocking mode on some platforms.
  stream.set_nonblocking(false)?;
  stream.set_read_timeout(Some(WORKER_READ_TIMEOUT))?;
  let request = read_request(&mut BufReader::new(stream))?;
  debug!("Locator request {:?}", request);

  let mut out = stream;
  match register.handle(request) {
    LocatorReply::Locations(response) => write_get_reply(&mut out, &response)?,
    LocatorReply::Flag(flag) => write_flag(&mut out, flag)?,
    LocatorReply::Lock(update_count) => write_lock_reply(&mut out, update_count)?,
  }
  Ok(())
}
