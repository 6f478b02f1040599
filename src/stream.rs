use crate::error::{Result, TokioSpdyError};
use crate::frame::{status, Frame, Sid};
use crate::headers::Headers;
use crate::session::SessionShared;
use crate::window::{self, RecvWindow, SendWindow};
use std::cmp;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Lifecycle of a stream, seen from the local endpoint.
///
/// FIN flags that arrive or leave before the stream is opened are carried by
/// `Opening` and applied once the reply is sent or received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
  Opening { local_fin: bool, remote_fin: bool },
  Open,
  HalfClosedLocal,
  HalfClosedRemote,
  Closed,
  Reset,
}

impl StreamState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, StreamState::Closed | StreamState::Reset)
  }

  pub fn can_write(&self) -> bool {
    matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
  }

  pub fn can_receive(&self) -> bool {
    matches!(
      self,
      StreamState::Opening {
        remote_fin: false,
        ..
      } | StreamState::Open
        | StreamState::HalfClosedLocal
    )
  }

  /// Local FIN already sent.
  pub fn local_closed(&self) -> bool {
    matches!(
      self,
      StreamState::Opening {
        local_fin: true,
        ..
      } | StreamState::HalfClosedLocal
        | StreamState::Closed
        | StreamState::Reset
    )
  }

  pub(crate) fn on_opened(self) -> Self {
    match self {
      StreamState::Opening {
        local_fin,
        remote_fin,
      } => match (local_fin, remote_fin) {
        (false, false) => StreamState::Open,
        (true, false) => StreamState::HalfClosedLocal,
        (false, true) => StreamState::HalfClosedRemote,
        (true, true) => StreamState::Closed,
      },
      s => s,
    }
  }

  pub(crate) fn on_local_fin(self) -> Self {
    match self {
      StreamState::Opening { remote_fin, .. } => StreamState::Opening {
        local_fin: true,
        remote_fin,
      },
      StreamState::Open => StreamState::HalfClosedLocal,
      StreamState::HalfClosedRemote => StreamState::Closed,
      s => s,
    }
  }

  pub(crate) fn on_remote_fin(self) -> Self {
    match self {
      StreamState::Opening { local_fin, .. } => StreamState::Opening {
        local_fin,
        remote_fin: true,
      },
      StreamState::Open => StreamState::HalfClosedRemote,
      StreamState::HalfClosedLocal => StreamState::Closed,
      s => s,
    }
  }
}

#[derive(Clone, Debug)]
pub(crate) struct StreamStatus {
  pub state: StreamState,
  // Why the stream was reset.
  pub error: Option<TokioSpdyError>,
  pub reply_headers: Option<Headers>,
}

pub(crate) enum StreamEvent {
  Data(Vec<u8>),
  Fin,
  Reset(TokioSpdyError),
}

// Sending side of the inbound queue. `unread` counts bytes queued or buffered
// by the handle and not yet consumed, they still hold session window credit.
struct Inbound {
  tx: Option<mpsc::UnboundedSender<StreamEvent>>,
  unread: usize,
}

/// Stream state shared by the session (table entry, router) and the handle.
pub(crate) struct StreamShared {
  pub sid: Sid,
  // Initiated by the local endpoint.
  pub local: bool,
  pub headers: Headers,

  status: watch::Sender<StreamStatus>,
  inbound: Mutex<Inbound>,

  pub send_window: SendWindow,
  pub recv_window: Mutex<RecvWindow>,
}

impl StreamShared {
  pub fn new(
    sid: Sid,
    local: bool,
    headers: Headers,
    state: StreamState,
    send_window: SendWindow,
    recv_window: RecvWindow,
  ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
    let (status, _) = watch::channel(StreamStatus {
      state,
      error: None,
      reply_headers: None,
    });
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Self {
      sid,
      local,
      headers,
      status,
      inbound: Mutex::new(Inbound {
        tx: Some(inbound_tx),
        unread: 0,
      }),
      send_window,
      recv_window: Mutex::new(recv_window),
    });
    (shared, inbound_rx)
  }

  pub fn state(&self) -> StreamState {
    self.status.borrow().state
  }

  pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
    self.status.subscribe()
  }

  /// Apply a transition and return the resulting state.
  pub fn update(&self, transition: impl FnOnce(StreamState) -> StreamState) -> StreamState {
    let mut next = StreamState::Reset;
    self.status.send_if_modified(|s| {
      next = transition(s.state);
      if next == s.state {
        return false;
      }
      s.state = next;
      true
    });
    next
  }

  /// Record the remote's SYN_REPLY. `None` if the stream is not opening.
  pub fn on_reply(&self, headers: Headers, fin: bool) -> Option<StreamState> {
    let mut next = None;
    self.status.send_if_modified(|s| {
      let StreamState::Opening {
        local_fin,
        remote_fin,
      } = s.state
      else {
        return false;
      };
      let state = StreamState::Opening {
        local_fin,
        remote_fin: remote_fin || fin,
      }
      .on_opened();
      s.state = state;
      s.reply_headers = Some(headers);
      next = Some(state);
      true
    });

    if next.is_some() && fin {
      self.push(StreamEvent::Fin);
    }
    next
  }

  fn push(&self, event: StreamEvent) -> bool {
    let inbound = window::lock(&self.inbound);
    match &inbound.tx {
      Some(tx) => tx.send(event).is_ok(),
      None => false,
    }
  }

  /// Queue inbound bytes. False if the handle is gone.
  pub fn push_data(&self, data: Vec<u8>) -> bool {
    let len = data.len();
    let mut inbound = window::lock(&self.inbound);
    let queued = match &inbound.tx {
      Some(tx) => tx.send(StreamEvent::Data(data)).is_ok(),
      None => false,
    };
    if queued {
      inbound.unread += len;
    }
    queued
  }

  /// Account for bytes handed to the application. False once the queue was
  /// abandoned, its credit has been returned already.
  pub fn consume(&self, n: usize) -> bool {
    let mut inbound = window::lock(&self.inbound);
    if inbound.tx.is_none() {
      return false;
    }
    inbound.unread = inbound.unread.saturating_sub(n);
    true
  }

  /// Close the inbound queue and return the bytes nobody will consume.
  pub fn abandon(&self) -> usize {
    let mut inbound = window::lock(&self.inbound);
    inbound.tx = None;
    std::mem::take(&mut inbound.unread)
  }

  pub fn on_remote_fin(&self) -> StreamState {
    let next = self.update(StreamState::on_remote_fin);
    self.push(StreamEvent::Fin);
    next
  }

  /// Move to `Reset` and release every suspended caller with `err`. Data
  /// still queued is dropped, the returned count is its size.
  /// Streams already closed or reset are left alone and return `None`.
  pub fn reset(&self, err: TokioSpdyError) -> Option<usize> {
    let changed = self.status.send_if_modified(|s| {
      if s.state.is_terminal() {
        return false;
      }
      s.state = StreamState::Reset;
      s.error = Some(err.clone());
      true
    });
    if !changed {
      return None;
    }

    self.send_window.close(err.clone());
    self.push(StreamEvent::Reset(err));
    Some(self.abandon())
  }
}

/// Use `Stream` to read data or write data from the remote.
///
/// `Stream` is created by calling `Session::create_stream()` or `Session::accept_stream()`.
/// `read` and `write` behave like a plain byte stream and may return short counts.
pub struct Stream {
  shared: Arc<StreamShared>,
  session: Arc<SessionShared>,

  inbound_rx: mpsc::UnboundedReceiver<StreamEvent>,
  status_rx: watch::Receiver<StreamStatus>,

  // Unread rest of the last data frame.
  read_buf: Vec<u8>,
  read_pos: usize,

  receive_remote_fin: bool,
  reset_err: Option<TokioSpdyError>,
}

// Dropping an open stream sends FIN to the remote unless FIN was already
// sent. An accepted stream that never replied is refused instead.
impl Drop for Stream {
  fn drop(&mut self) {
    // Nobody reads the queued data anymore, hand its credit back.
    let unread = self.shared.abandon();
    self.session.on_data_consumed(unread);

    let sid = self.shared.sid;
    let state = self.shared.state();
    if state.local_closed() {
      return;
    }

    if !self.shared.local && matches!(state, StreamState::Opening { .. }) {
      self.session.send_control(Frame::rst(sid, status::REFUSED_STREAM));
      let err = TokioSpdyError::StreamReset {
        sid,
        status: status::REFUSED_STREAM,
      };
      self.session.reset_stream(&self.shared, err);
      return;
    }

    let next = self.shared.update(StreamState::on_local_fin);
    if next.is_terminal() {
      self.session.forget(sid);
    }
    self.session.send_fin_detached(sid);
  }
}

impl Stream {
  pub(crate) fn new(
    shared: Arc<StreamShared>,
    inbound_rx: mpsc::UnboundedReceiver<StreamEvent>,
    session: Arc<SessionShared>,
  ) -> Self {
    let status_rx = shared.subscribe();
    Self {
      shared,
      session,
      inbound_rx,
      status_rx,
      read_buf: vec![],
      read_pos: 0,
      receive_remote_fin: false,
      reset_err: None,
    }
  }

  // Get stream id.
  pub fn sid(&self) -> Sid {
    self.shared.sid
  }

  /// Headers sent or received with the SYN_STREAM frame.
  pub fn headers(&self) -> &Headers {
    &self.shared.headers
  }

  /// Headers of the remote's SYN_REPLY, once it arrived.
  pub fn reply_headers(&self) -> Option<Headers> {
    self.status_rx.borrow().reply_headers.clone()
  }

  pub fn state(&self) -> StreamState {
    self.shared.state()
  }

  fn reset_error(&self) -> TokioSpdyError {
    self.status_rx.borrow().error.clone().unwrap_or(TokioSpdyError::StreamReset {
      sid: self.shared.sid,
      status: status::CANCEL,
    })
  }

  /// Wait until the remote acknowledged the stream with SYN_REPLY.
  ///
  /// Returns at once for accepted streams. Fails if the stream is reset first.
  pub async fn wait(&mut self) -> Result<()> {
    if self.shared.local {
      let res = self
        .status_rx
        .wait_for(|s| !matches!(s.state, StreamState::Opening { .. }))
        .await
        .map(|s| s.state);
      if res.is_err() {
        return Err(TokioSpdyError::SessionClosed);
      }
    }

    if self.shared.state() == StreamState::Reset {
      return Err(self.reset_error());
    }
    Ok(())
  }

  /// Answer an accepted stream with SYN_REPLY.
  pub async fn reply(&mut self, headers: Headers, fin: bool) -> Result<()> {
    let state = self.shared.state();
    if state == StreamState::Reset {
      return Err(self.reset_error());
    }
    if self.shared.local || !matches!(state, StreamState::Opening { .. }) {
      return Err(TokioSpdyError::InvalidOperation {
        msg: format!("stream {} cannot reply in state {:?}", self.sid(), state),
      });
    }

    self
      .session
      .write_frame(Frame::reply(self.sid(), headers, fin))
      .await?;

    let next = self.shared.update(|s| {
      let s = if fin { s.on_local_fin() } else { s };
      s.on_opened()
    });
    if next.is_terminal() {
      self.session.forget(self.sid());
    }
    Ok(())
  }

  // Writing before the stream is open waits for the reply, or sends an
  // empty one on accepted streams.
  async fn ready_for_write(&mut self) -> Result<StreamState> {
    let state = self.shared.state();
    if let StreamState::Opening { local_fin, .. } = state {
      if local_fin {
        return Err(TokioSpdyError::StreamClosedForWrite);
      }
      if self.shared.local {
        self.wait().await?;
      } else {
        self.reply(Headers::new(), false).await?;
      }
    }

    let state = self.shared.state();
    if state == StreamState::Reset {
      return Err(self.reset_error());
    }
    if !state.can_write() {
      return Err(TokioSpdyError::StreamClosedForWrite);
    }
    Ok(state)
  }

  async fn write_inner(&mut self, data: &[u8], fin: bool) -> Result<usize> {
    self.ready_for_write().await?;

    let chunk = cmp::min(data.len(), self.session.max_frame_size());
    let n = self.shared.send_window.acquire(chunk).await?;
    let n = match self.session.send_window.acquire(n).await {
      Ok(m) => {
        self.shared.send_window.release(n - m);
        m
      }
      Err(err) => {
        self.shared.send_window.release(n);
        return Err(err);
      }
    };

    // The stream may have been reset while waiting for credit.
    if let Err(err) = self.ready_for_write().await {
      self.shared.send_window.release(n);
      self.session.send_window.release(n);
      return Err(err);
    }

    let fin = fin && n == data.len();
    self
      .session
      .write_frame(Frame::data(self.sid(), data[..n].to_vec(), fin))
      .await?;

    if fin {
      let next = self.shared.update(StreamState::on_local_fin);
      if next.is_terminal() {
        self.session.forget(self.sid());
      }
    }
    Ok(n)
  }

  /// Write data to the remote and return how many bytes were sent.
  ///
  /// Sends at most one data frame. Suspends while the stream or session send
  /// window is exhausted. Writing 0 bytes does nothing.
  pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
      return Ok(0);
    }
    self.write_inner(data, false).await
  }

  pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
      let n = self.write(data).await?;
      data = &data[n..];
    }
    Ok(())
  }

  /// Write all of `data` and close the local side, FIN rides on the last frame.
  pub async fn write_fin(&mut self, mut data: &[u8]) -> Result<()> {
    if data.is_empty() {
      return self.close().await;
    }
    while !data.is_empty() {
      let n = self.write_inner(data, true).await?;
      data = &data[n..];
    }
    Ok(())
  }

  /// Read data from the remote.
  ///
  /// Returning `Ok(0)` means the remote closed its side and every byte has
  /// been read. Data still queued when the stream is reset is dropped.
  pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    if self.shared.state() == StreamState::Reset {
      return Err(self.reset_error());
    }

    loop {
      if self.read_pos < self.read_buf.len() {
        let n = cmp::min(buf.len(), self.read_buf.len() - self.read_pos);
        buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        self.on_consumed(n);
        return Ok(n);
      }

      if self.receive_remote_fin {
        return Ok(0);
      }
      if let Some(err) = &self.reset_err {
        return Err(err.clone());
      }

      match self.inbound_rx.recv().await {
        Some(StreamEvent::Data(data)) => {
          self.read_buf = data;
          self.read_pos = 0;
        }
        Some(StreamEvent::Fin) => {
          self.receive_remote_fin = true;
          return Ok(0);
        }
        Some(StreamEvent::Reset(err)) => {
          self.reset_err = Some(err.clone());
          return Err(err);
        }
        None => return Err(TokioSpdyError::SessionClosed),
      }
    }
  }

  fn on_consumed(&self, n: usize) {
    // The credit was returned when the stream was reset.
    if !self.shared.consume(n) {
      return;
    }

    let delta = window::lock(&self.shared.recv_window).on_data_consumed(n);
    if let Some(delta) = delta {
      // No more data will come after the remote FIN.
      if self.shared.state().can_receive() {
        self
          .session
          .send_control(Frame::window_update(self.sid(), delta));
      }
    }
    self.session.on_data_consumed(n);
  }

  /// Send FIN to the remote if not sent yet. Does not wait for the remote
  /// to close its side.
  pub async fn close(&mut self) -> Result<()> {
    let state = self.shared.state();
    if state.local_closed() {
      return Ok(());
    }
    if !self.shared.local && matches!(state, StreamState::Opening { .. }) {
      return self.reply(Headers::new(), true).await;
    }

    self
      .session
      .write_frame(Frame::data(self.sid(), vec![], true))
      .await?;

    let next = self.shared.update(StreamState::on_local_fin);
    if next.is_terminal() {
      self.session.forget(self.sid());
    }
    log::debug!("[stream] {} closed locally, state {:?}", self.sid(), next);
    Ok(())
  }

  /// Abort the stream with RST_STREAM.
  pub fn reset(&mut self, code: u32) {
    let sid = self.sid();
    if self.shared.state().is_terminal() {
      return;
    }
    self.session.send_control(Frame::rst(sid, code));
    self
      .session
      .reset_stream(&self.shared, TokioSpdyError::StreamReset { sid, status: code });
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_state_transitions() {
    let opening = StreamState::Opening {
      local_fin: false,
      remote_fin: false,
    };
    assert_eq!(opening.on_opened(), StreamState::Open);
    assert!(!opening.can_write());
    assert!(opening.can_receive());

    let open = opening.on_opened();
    assert!(open.can_write());
    assert_eq!(open.on_local_fin(), StreamState::HalfClosedLocal);
    assert_eq!(open.on_remote_fin(), StreamState::HalfClosedRemote);
    assert_eq!(
      open.on_local_fin().on_remote_fin(),
      StreamState::Closed
    );
    assert_eq!(
      open.on_remote_fin().on_local_fin(),
      StreamState::Closed
    );

    // writes stay legal after the remote finished
    assert!(StreamState::HalfClosedRemote.can_write());
    assert!(!StreamState::HalfClosedRemote.can_receive());
    assert!(!StreamState::HalfClosedLocal.can_write());
    assert!(StreamState::HalfClosedLocal.can_receive());

    // FIN before the reply is applied on open
    let early = opening.on_local_fin();
    assert!(early.local_closed());
    assert_eq!(early.on_opened(), StreamState::HalfClosedLocal);
    assert_eq!(early.on_remote_fin().on_opened(), StreamState::Closed);

    // terminal states never move
    assert_eq!(StreamState::Reset.on_local_fin(), StreamState::Reset);
    assert_eq!(StreamState::Closed.on_remote_fin(), StreamState::Closed);
    assert!(StreamState::Reset.is_terminal());
    assert!(!StreamState::Reset.can_write());
  }

  fn shared(sid: Sid, local: bool) -> (Arc<StreamShared>, mpsc::UnboundedReceiver<StreamEvent>) {
    StreamShared::new(
      sid,
      local,
      Headers::new(),
      StreamState::Opening {
        local_fin: false,
        remote_fin: false,
      },
      SendWindow::new(sid, 100),
      RecvWindow::new(sid, 100, 2),
    )
  }

  #[tokio::test]
  async fn test_shared_reply_and_fin() {
    let (stream, mut rx) = shared(1, true);

    let headers: Headers = [("status", "200")].into_iter().collect();
    assert_eq!(stream.on_reply(headers, false), Some(StreamState::Open));
    // a second reply is not accepted
    assert_eq!(stream.on_reply(Headers::new(), false), None);

    assert!(stream.push_data(vec![1, 2]));
    assert_eq!(stream.on_remote_fin(), StreamState::HalfClosedRemote);

    assert!(matches!(rx.recv().await, Some(StreamEvent::Data(d)) if d == vec![1, 2]));
    assert!(matches!(rx.recv().await, Some(StreamEvent::Fin)));

    drop(rx);
    assert!(!stream.push_data(vec![3]));
  }

  #[tokio::test]
  async fn test_shared_reset_once() {
    let (stream, mut rx) = shared(2, false);

    let err = TokioSpdyError::StreamReset {
      sid: 2,
      status: status::CANCEL,
    };
    assert_eq!(stream.reset(err.clone()), Some(0));
    assert_eq!(stream.reset(TokioSpdyError::SessionClosed), None);
    assert_eq!(stream.state(), StreamState::Reset);

    assert!(matches!(rx.recv().await, Some(StreamEvent::Reset(e)) if e == err));
    assert_eq!(stream.send_window.acquire(1).await, Err(err));
  }

  #[tokio::test]
  async fn test_shared_counts_unread_bytes() {
    let (stream, mut rx) = shared(1, true);

    assert!(stream.push_data(vec![0; 30]));
    assert!(stream.push_data(vec![0; 20]));
    assert!(stream.consume(30));
    assert!(matches!(rx.recv().await, Some(StreamEvent::Data(d)) if d.len() == 30));

    // a reset drops what is still queued and reports its size once
    let err = TokioSpdyError::StreamReset {
      sid: 1,
      status: status::CANCEL,
    };
    assert_eq!(stream.reset(err), Some(20));
    assert_eq!(stream.abandon(), 0);
    assert!(!stream.consume(20));
    assert!(!stream.push_data(vec![1]));
  }

  #[test]
  fn test_shared_abandon_stops_counting() {
    let (stream, _rx) = shared(2, false);

    assert!(stream.push_data(vec![0; 10]));
    assert_eq!(stream.abandon(), 10);
    assert!(!stream.push_data(vec![0; 5]));
    assert_eq!(stream.abandon(), 0);
    // nothing left to credit once reset
    assert_eq!(stream.reset(TokioSpdyError::SessionClosed), Some(0));
  }
}
