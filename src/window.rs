//! Credit based flow control.
//!
//! The receiver advertises how many bytes it is willing to buffer. The sender
//! reserves credit before putting DATA on the wire and suspends when none is
//! left, the receiver hands credit back with WINDOW_UPDATE frames as the
//! application drains its read queue. Windows exist per stream and for the
//! whole session (stream id 0).

use crate::error::{Result, TokioSpdyError};
use crate::frame::Sid;
use std::cmp;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Window both sides assume until SETTINGS or WINDOW_UPDATE say otherwise.
pub const DEFAULT_WINDOW: u32 = 64 * 1024;

pub const MAX_WINDOW: u32 = i32::MAX as u32;

/// Lock window bookkeeping. Counters are updated without panicking paths, a
/// poisoned lock still holds them intact.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
struct Credit {
  // May drop below zero when the remote shrinks its initial window.
  available: i64,
  closed: Option<TokioSpdyError>,
}

/// Our view of the remote's receive window.
pub(crate) struct SendWindow {
  sid: Sid,
  credit: watch::Sender<Credit>,
}

impl SendWindow {
  pub fn new(sid: Sid, initial: u32) -> Self {
    let (credit, _) = watch::channel(Credit {
      available: initial as i64,
      closed: None,
    });
    Self { sid, credit }
  }

  #[cfg(test)]
  pub fn available(&self) -> i64 {
    self.credit.borrow().available
  }

  /// Reserve up to `max` bytes of credit, suspending while none is available.
  ///
  /// Reserved bytes count as sent. Returns the error given to `close` once the
  /// window is closed.
  pub async fn acquire(&self, max: usize) -> Result<usize> {
    if max == 0 {
      return Ok(0);
    }

    let mut rx = self.credit.subscribe();
    loop {
      if rx
        .wait_for(|c| c.available > 0 || c.closed.is_some())
        .await
        .is_err()
      {
        return Err(TokioSpdyError::SessionClosed);
      }

      let mut taken = 0;
      let mut closed = None;
      self.credit.send_if_modified(|c| {
        if let Some(err) = &c.closed {
          closed = Some(err.clone());
          return false;
        }
        if c.available <= 0 {
          // Another writer got there first.
          return false;
        }
        taken = cmp::min(c.available as u64, max as u64) as usize;
        c.available -= taken as i64;
        true
      });

      if let Some(err) = closed {
        return Err(err);
      }
      if taken > 0 {
        return Ok(taken);
      }
    }
  }

  /// Give back credit reserved by `acquire` but never sent.
  pub fn release(&self, n: usize) {
    if n == 0 {
      return;
    }
    self.credit.send_modify(|c| c.available += n as i64);
  }

  /// Apply a WINDOW_UPDATE from the remote.
  pub fn grant(&self, delta: u32) -> Result<()> {
    let mut overflow = false;
    self.credit.send_if_modified(|c| {
      let next = c.available + delta as i64;
      if next > MAX_WINDOW as i64 {
        overflow = true;
        return false;
      }
      c.available = next;
      true
    });

    if overflow {
      return Err(TokioSpdyError::ProtocolViolation {
        msg: format!("send window of stream {} overflows", self.sid),
      });
    }
    Ok(())
  }

  /// Shift the window after the remote changed its initial window size.
  pub fn adjust(&self, diff: i64) {
    if diff == 0 {
      return;
    }
    self.credit.send_modify(|c| c.available += diff);
  }

  /// Release every suspended writer with `err`. Only the first error sticks.
  pub fn close(&self, err: TokioSpdyError) {
    self.credit.send_if_modified(|c| {
      if c.closed.is_some() {
        return false;
      }
      c.closed = Some(err);
      true
    });
  }
}

/// Our bookkeeping of the window we granted to the remote.
#[derive(Debug)]
pub(crate) struct RecvWindow {
  sid: Sid,
  // Currently enforced limit.
  window: u32,
  // Configured limit. Differs from `window` only until the remote
  // acknowledged our SETTINGS.
  target: u32,
  // Received and not yet credited back.
  outstanding: u32,
  // Consumed by the application and not yet credited back.
  pending: u32,
  ratio: u32,
}

impl RecvWindow {
  pub fn new(sid: Sid, window: u32, ratio: u32) -> Self {
    Self {
      sid,
      window,
      target: window,
      outstanding: 0,
      pending: 0,
      ratio: cmp::max(ratio, 1),
    }
  }

  /// A window for a stream opened before the remote acknowledged our
  /// SETTINGS. The remote may still assume the default window.
  pub fn provisional(sid: Sid, target: u32, ratio: u32) -> Self {
    let mut window = Self::new(sid, target, ratio);
    window.window = cmp::max(target, DEFAULT_WINDOW);
    window
  }

  pub fn on_settings_acked(&mut self) {
    self.window = self.target;
  }

  /// Account for an inbound DATA payload.
  pub fn on_data_received(&mut self, n: usize) -> Result<()> {
    if self.outstanding as u64 + n as u64 > self.window as u64 {
      return Err(TokioSpdyError::WindowExceeded { sid: self.sid });
    }
    self.outstanding += n as u32;
    Ok(())
  }

  /// Account for bytes drained by the application. Returns the delta of the
  /// WINDOW_UPDATE to send, batched until a fraction of the window is reached.
  pub fn on_data_consumed(&mut self, n: usize) -> Option<u32> {
    self.pending = self.pending.saturating_add(n as u32);
    let threshold = cmp::max(self.target / self.ratio, 1);
    if self.pending < threshold {
      return None;
    }

    let delta = self.pending;
    self.outstanding = self.outstanding.saturating_sub(delta);
    self.pending = 0;
    Some(delta)
  }

  #[cfg(test)]
  pub fn outstanding(&self) -> u32 {
    self.outstanding
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn test_send_window_blocks_until_grant() {
    let window = Arc::new(SendWindow::new(1, 10));

    assert_eq!(window.acquire(4).await.unwrap(), 4);
    // Only 6 left, short reservation.
    assert_eq!(window.acquire(100).await.unwrap(), 6);
    assert_eq!(window.available(), 0);

    let handle = window.clone();
    let join = tokio::spawn(async move { handle.acquire(100).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!join.is_finished());

    window.grant(30).unwrap();
    assert_eq!(join.await.unwrap().unwrap(), 30);
  }

  #[tokio::test]
  async fn test_send_window_close_releases_writer() {
    let window = Arc::new(SendWindow::new(1, 0));
    let handle = window.clone();
    let join = tokio::spawn(async move { handle.acquire(1).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    window.close(TokioSpdyError::SessionClosed);
    window.close(TokioSpdyError::KeepAliveTimeout);

    assert_eq!(join.await.unwrap(), Err(TokioSpdyError::SessionClosed));
    assert_eq!(window.acquire(1).await, Err(TokioSpdyError::SessionClosed));
  }

  #[tokio::test]
  async fn test_send_window_adjust() {
    let window = SendWindow::new(1, DEFAULT_WINDOW);
    assert_eq!(window.acquire(1000).await.unwrap(), 1000);

    // remote shrinks its initial window to 256
    window.adjust(256 - DEFAULT_WINDOW as i64);
    assert_eq!(window.available(), 256 - 1000);

    window.release(744);
    assert_eq!(window.available(), 0);
    assert!(window.grant(MAX_WINDOW).is_ok());
    assert!(window.grant(1).is_err());
  }

  #[test]
  fn test_recv_window() {
    let mut window = RecvWindow::new(3, 100, 2);

    assert!(window.on_data_received(60).is_ok());
    assert!(window.on_data_received(40).is_ok());
    assert_eq!(
      window.on_data_received(1),
      Err(TokioSpdyError::WindowExceeded { sid: 3 })
    );

    // batched until half the window is consumed
    assert_eq!(window.on_data_consumed(30), None);
    assert_eq!(window.on_data_consumed(20), Some(50));
    assert_eq!(window.outstanding(), 50);

    assert!(window.on_data_received(50).is_ok());
    assert!(window.on_data_received(1).is_err());
  }

  #[test]
  fn test_recv_window_provisional() {
    let mut window = RecvWindow::provisional(1, 256, 2);
    // The remote may use the default window before it saw our SETTINGS.
    assert!(window.on_data_received(1000).is_ok());
    assert_eq!(window.on_data_consumed(1000), Some(1000));

    window.on_settings_acked();
    assert!(window.on_data_received(256).is_ok());
    assert!(window.on_data_received(1).is_err());
  }
}
