use crate::error::{Result, TokioSpdyError};
use crate::frame::{MAX_FRAME_LENGTH, VERSION};
use crate::window::{DEFAULT_WINDOW, MAX_WINDOW};
use core::time;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SpdyConfig {
  // Protocol version, support 3
  pub version: u8,
  // Disable keepalive
  pub keep_alive_disable: bool,
  // keep_alive_interval is how often to send a PING to the remote
  pub keep_alive_interval: Duration,
  // The session will be closed if no frame has arrived within keep_alive_timeout.
  pub keep_alive_timeout: Duration,

  // Receive window granted to the remote for each stream. Default: 256 KiB.
  pub initial_window_size: u32,
  // Receive window granted to the remote for the whole session, must not be
  // smaller than the 64 KiB default window. Default: 1 MiB.
  pub session_window_size: u32,
  // A window update is sent once `window / window_update_ratio` bytes have
  // been consumed. Default: 2.
  pub window_update_ratio: u32,

  // Max payload size of outgoing data frames. Default: 16 KiB.
  pub max_frame_size: u32,
  // Max number of remote-initiated streams alive at the same time.
  pub max_concurrent_streams: u32,

  // Max number of pending writing frames in queue.
  // More writing frames operations will be blocked. Default: 4096.
  pub writing_frame_channel_capacity: usize,

  // Max number of remote-initiated streams waiting for `accept_stream`.
  // More streams will be refused. Default: 1024.
  pub accept_backlog: usize,
}

impl Default for SpdyConfig {
  fn default() -> Self {
    Self {
      version: VERSION,
      keep_alive_interval: time::Duration::from_secs(10),
      keep_alive_timeout: time::Duration::from_secs(30),
      keep_alive_disable: false,
      initial_window_size: 256 * 1024,
      session_window_size: 1024 * 1024,
      window_update_ratio: 2,
      max_frame_size: 16 * 1024,
      max_concurrent_streams: 1000,
      writing_frame_channel_capacity: 4096,
      accept_backlog: 1024,
    }
  }
}

impl SpdyConfig {
  pub fn verify_config(&self) -> Result<()> {
    if self.version != VERSION {
      return Err(invalid("unsupported protocol version"));
    }

    if !self.keep_alive_disable {
      if self.keep_alive_interval == time::Duration::from_secs(0) {
        return Err(invalid("keep-alive interval must be positive"));
      }
      if self.keep_alive_timeout < self.keep_alive_interval {
        return Err(invalid(
          "keep-alive timeout must be larger than keep-alive interval",
        ));
      }
    }

    if self.initial_window_size == 0 || self.initial_window_size > MAX_WINDOW {
      return Err(invalid("initial window size out of range"));
    }
    if self.session_window_size < DEFAULT_WINDOW || self.session_window_size > MAX_WINDOW {
      return Err(invalid("session window size out of range"));
    }
    if self.window_update_ratio < 1 {
      return Err(invalid("window update ratio must be positive"));
    }
    if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_LENGTH {
      return Err(invalid("max frame size out of range"));
    }
    if self.writing_frame_channel_capacity == 0 || self.accept_backlog == 0 {
      return Err(invalid("channel capacity must be positive"));
    }

    Ok(())
  }
}

fn invalid(msg: &str) -> TokioSpdyError {
  TokioSpdyError::InvalidConfig {
    msg: msg.to_string(),
  }
}

#[test]
fn test_config() {
  let mut config = SpdyConfig::default();

  assert!(config.verify_config().is_ok());

  config.version = 2;

  assert!(config.verify_config().is_err());
}

#[test]
fn test_config_windows() {
  let mut config = SpdyConfig::default();
  config.session_window_size = DEFAULT_WINDOW - 1;
  assert!(config.verify_config().is_err());

  let mut config = SpdyConfig::default();
  // Tiny stream windows are allowed, the provisional window covers them.
  config.initial_window_size = 256;
  assert!(config.verify_config().is_ok());
  config.initial_window_size = 0;
  assert!(config.verify_config().is_err());

  let mut config = SpdyConfig::default();
  config.keep_alive_timeout = Duration::from_secs(1);
  assert!(config.verify_config().is_err());
  config.keep_alive_disable = true;
  assert!(config.verify_config().is_ok());
}
