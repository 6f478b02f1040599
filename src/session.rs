use crate::config::SpdyConfig;
use crate::error::{Result, TokioSpdyError};
use crate::frame::{setting, status, Frame, Setting, Sid, MAX_FRAME_LENGTH};
use crate::frame_router::{FrameRouter, PendingStream};
use crate::headers::Headers;
use crate::session_inner::{SessionInner, WriteRequest};
use crate::stream::{Stream, StreamEvent, StreamShared, StreamState};
use crate::window::{self, RecvWindow, SendWindow, DEFAULT_WINDOW, MAX_WINDOW};
use dashmap::DashMap;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

const MAX_READ_REQ: usize = 4096;

// Stream ids are 31 bits wide on the wire of SPDY, keep the same range.
const MAX_SID: Sid = 0x7fff_ffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
  Active,
  // GOAWAY sent or received, no new streams.
  GoingAway,
  Closed,
}

#[derive(Clone, Debug)]
pub(crate) struct SessionStatus {
  pub state: SessionState,
  pub err: Option<TokioSpdyError>,
}

/// State shared by the session handle, its streams, the I/O task and the router.
pub(crate) struct SessionShared {
  pub config: SpdyConfig,
  pub is_client: bool,

  pub streams: DashMap<Sid, Arc<StreamShared>>,

  status: watch::Sender<SessionStatus>,
  close_tx: broadcast::Sender<()>,
  goaway_sent: AtomicBool,

  write_tx: mpsc::Sender<WriteRequest>,
  control_tx: mpsc::UnboundedSender<Frame>,

  // Next id for locally initiated streams. Guarded so that SYN frames hit
  // the wire in id order.
  next_sid: Mutex<Sid>,
  next_sid_hint: AtomicU32,
  // Highest id the remote opened.
  last_remote_sid: AtomicU32,

  next_ping_id: AtomicU32,
  pub pings: DashMap<u32, oneshot::Sender<()>>,

  // Settings announced by the remote. The initial window is locked while
  // streams are created or adjusted so that none misses a change.
  peer_initial_window: std::sync::Mutex<u32>,
  peer_max_frame_size: AtomicU32,
  peer_max_streams: AtomicU32,
  settings_acked: AtomicBool,

  pub send_window: SendWindow,
  pub recv_window: std::sync::Mutex<RecvWindow>,
}

impl SessionShared {
  pub fn new(
    config: SpdyConfig,
    is_client: bool,
    write_tx: mpsc::Sender<WriteRequest>,
    control_tx: mpsc::UnboundedSender<Frame>,
  ) -> Self {
    let first_sid: Sid = if is_client { 1 } else { 2 };
    let (status, _) = watch::channel(SessionStatus {
      state: SessionState::Active,
      err: None,
    });
    let (close_tx, _) = broadcast::channel(1);
    let recv_window = RecvWindow::new(0, config.session_window_size, config.window_update_ratio);

    Self {
      is_client,
      streams: DashMap::new(),
      status,
      close_tx,
      goaway_sent: AtomicBool::new(false),
      write_tx,
      control_tx,
      next_sid: Mutex::new(first_sid),
      next_sid_hint: AtomicU32::new(first_sid),
      last_remote_sid: AtomicU32::new(0),
      next_ping_id: AtomicU32::new(first_sid),
      pings: DashMap::new(),
      peer_initial_window: std::sync::Mutex::new(DEFAULT_WINDOW),
      peer_max_frame_size: AtomicU32::new(MAX_FRAME_LENGTH),
      peer_max_streams: AtomicU32::new(u32::MAX),
      settings_acked: AtomicBool::new(false),
      send_window: SendWindow::new(0, DEFAULT_WINDOW),
      recv_window: std::sync::Mutex::new(recv_window),
      config,
    }
  }

  pub fn state(&self) -> SessionState {
    self.status.borrow().state
  }

  pub fn inner_err(&self) -> Option<TokioSpdyError> {
    self.status.borrow().err.clone()
  }

  /// The error handed to callers once the session is closed.
  pub fn closed_err(&self) -> TokioSpdyError {
    self.inner_err().unwrap_or(TokioSpdyError::SessionClosed)
  }

  pub fn subscribe_close(&self) -> broadcast::Receiver<()> {
    self.close_tx.subscribe()
  }

  pub fn is_local_sid(&self, sid: Sid) -> bool {
    sid != 0 && (sid % 2 == 1) == self.is_client
  }

  /// Whether `sid` was handed out at some point, by either side.
  pub fn was_opened(&self, sid: Sid) -> bool {
    if self.is_local_sid(sid) {
      sid < self.next_sid_hint.load(Ordering::Acquire)
    } else {
      sid <= self.last_remote_sid.load(Ordering::Acquire)
    }
  }

  pub fn last_remote_sid(&self) -> Sid {
    self.last_remote_sid.load(Ordering::Acquire)
  }

  pub fn set_last_remote_sid(&self, sid: Sid) {
    self.last_remote_sid.fetch_max(sid, Ordering::AcqRel);
  }

  pub fn next_ping_id(&self) -> u32 {
    self.next_ping_id.fetch_add(2, Ordering::AcqRel)
  }

  pub fn max_frame_size(&self) -> usize {
    cmp::min(
      self.config.max_frame_size,
      self.peer_max_frame_size.load(Ordering::Acquire),
    ) as usize
  }

  pub fn count_streams(&self, local: bool) -> usize {
    self.streams.iter().filter(|s| s.local == local).count()
  }

  /// Build a stream with windows derived from the current settings and
  /// register it in the stream table.
  pub fn new_stream(
    &self,
    sid: Sid,
    local: bool,
    headers: Headers,
    state: StreamState,
  ) -> (Arc<StreamShared>, mpsc::UnboundedReceiver<crate::stream::StreamEvent>) {
    let peer_window = window::lock(&self.peer_initial_window);
    let send_window = SendWindow::new(sid, *peer_window);
    let recv_window = if self.settings_acked.load(Ordering::Acquire) {
      RecvWindow::new(sid, self.config.initial_window_size, self.config.window_update_ratio)
    } else {
      RecvWindow::provisional(sid, self.config.initial_window_size, self.config.window_update_ratio)
    };

    let (stream, rx) = StreamShared::new(sid, local, headers, state, send_window, recv_window);
    self.streams.insert(sid, stream.clone());
    drop(peer_window);
    (stream, rx)
  }

  pub fn get_stream(&self, sid: Sid) -> Option<Arc<StreamShared>> {
    self.streams.get(&sid).map(|s| s.value().clone())
  }

  /// Drop a stream from the table once it is closed or reset.
  pub fn forget(&self, sid: Sid) {
    if self.streams.remove(&sid).is_some() {
      log::debug!("[session] stream {} removed", sid);
    }
  }

  pub fn send_control(&self, frame: Frame) {
    // Fails only when the I/O task is gone, which means the session is closed.
    let _ = self.control_tx.send(frame);
  }

  /// Queue a frame on the ordered write queue and return the completion signal.
  pub async fn enqueue(&self, frame: Frame) -> Result<oneshot::Receiver<()>> {
    if self.state() == SessionState::Closed {
      return Err(self.closed_err());
    }

    let (finish_tx, finish_rx) = oneshot::channel();
    let req = WriteRequest {
      frame,
      finish_tx: Some(finish_tx),
    };
    if self.write_tx.send(req).await.is_err() {
      return Err(self.closed_err());
    }
    Ok(finish_rx)
  }

  /// Write a frame through the single writer and wait until it hit the transport.
  pub async fn write_frame(&self, frame: Frame) -> Result<()> {
    let finish_rx = self.enqueue(frame).await?;
    // When the operation fails, expose the inner error to users, which is
    // more useful than "session closed".
    finish_rx.await.map_err(|_| self.closed_err())
  }

  /// Send FIN from a context that cannot wait, like `Drop`.
  pub fn send_fin_detached(&self, sid: Sid) {
    let req = WriteRequest {
      frame: Frame::data(sid, vec![], true),
      finish_tx: None,
    };
    match self.write_tx.try_send(req) {
      Ok(()) => {}
      Err(mpsc::error::TrySendError::Full(req)) => {
        let write_tx = self.write_tx.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
          handle.spawn(async move {
            // allow failure
            let _ = write_tx.send(req).await;
          });
        }
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
  }

  /// Credit session window for bytes the application read or that were dropped.
  pub fn on_data_consumed(&self, n: usize) {
    if n == 0 {
      return;
    }
    let delta = window::lock(&self.recv_window).on_data_consumed(n);
    if let Some(delta) = delta {
      self.send_control(Frame::window_update(0, delta));
    }
  }

  pub fn apply_settings(&self, settings: &[Setting]) -> Result<()> {
    for s in settings {
      match s.id {
        setting::INITIAL_WINDOW_SIZE => {
          if s.value > MAX_WINDOW {
            return Err(TokioSpdyError::ProtocolViolation {
              msg: format!("initial window size {} too large", s.value),
            });
          }
          let mut peer_window = window::lock(&self.peer_initial_window);
          let diff = s.value as i64 - *peer_window as i64;
          *peer_window = s.value;
          for stream in self.streams.iter() {
            stream.send_window.adjust(diff);
          }
        }
        setting::MAX_FRAME_SIZE => {
          if s.value == 0 || s.value > MAX_FRAME_LENGTH {
            return Err(TokioSpdyError::ProtocolViolation {
              msg: format!("max frame size {} out of range", s.value),
            });
          }
          self.peer_max_frame_size.store(s.value, Ordering::Release);
        }
        setting::MAX_CONCURRENT_STREAMS => {
          self.peer_max_streams.store(s.value, Ordering::Release);
        }
        id => {
          log::debug!("[session] ignore unknown setting {}", id);
        }
      }
    }
    Ok(())
  }

  pub fn on_settings_acked(&self) {
    if self.settings_acked.swap(true, Ordering::AcqRel) {
      return;
    }
    let streams: Vec<Arc<StreamShared>> = self.streams.iter().map(|s| s.value().clone()).collect();
    for stream in streams {
      window::lock(&stream.recv_window).on_settings_acked();
    }
  }

  /// Reset a stream, return the session credit of its unread data and drop
  /// it from the table.
  pub fn reset_stream(&self, stream: &StreamShared, err: TokioSpdyError) {
    if let Some(unread) = stream.reset(err) {
      self.on_data_consumed(unread);
    }
    self.forget(stream.sid);
  }

  fn send_go_away(&self, code: u32) {
    if self.goaway_sent.swap(true, Ordering::AcqRel) {
      return;
    }
    self.send_control(Frame::go_away(self.last_remote_sid(), code));
  }

  /// Stop creating streams. Existing streams keep working.
  pub fn go_away(&self) -> Result<()> {
    if self.state() == SessionState::Closed {
      return Err(self.closed_err());
    }
    self.status.send_if_modified(|s| {
      if s.state != SessionState::Active {
        return false;
      }
      s.state = SessionState::GoingAway;
      true
    });
    self.send_go_away(status::OK);
    Ok(())
  }

  /// Handle a GOAWAY from the remote. Local streams above `last_sid` were
  /// never processed by the remote.
  pub fn on_go_away(&self, last_sid: Sid, code: u32) {
    log::debug!("[session] remote goes away, last sid {}, status {}", last_sid, code);
    self.status.send_if_modified(|s| {
      if s.state != SessionState::Active {
        return false;
      }
      s.state = SessionState::GoingAway;
      true
    });

    let refused: Vec<Arc<StreamShared>> = self
      .streams
      .iter()
      .filter(|s| s.local && s.sid > last_sid)
      .map(|s| s.value().clone())
      .collect();
    for stream in refused {
      self.reset_stream(&stream, TokioSpdyError::SessionGoAway);
    }
  }

  /// Close the session with `err` and release every suspended caller.
  /// Only the first call has any effect.
  pub fn terminate(&self, err: TokioSpdyError) {
    let first = self.status.send_if_modified(|s| {
      if s.state == SessionState::Closed {
        return false;
      }
      s.state = SessionState::Closed;
      s.err = Some(err.clone());
      true
    });
    if !first {
      return;
    }

    if err == TokioSpdyError::SessionClosed {
      log::debug!("[session] closed");
    } else {
      log::warn!("[session] terminated: {}", err);
    }

    if !matches!(err, TokioSpdyError::Io { .. }) {
      self.send_go_away(err.goaway_status());
    }

    self.send_window.close(err.clone());
    let streams: Vec<Arc<StreamShared>> = self.streams.iter().map(|s| s.value().clone()).collect();
    self.streams.clear();
    for stream in streams {
      // No credit to return, the session is done.
      let _ = stream.reset(err.clone());
    }
    // Pending pings fail once their senders are dropped.
    self.pings.clear();

    let _ = self.close_tx.send(());
  }

  /// Allocate the next local id, register the stream and send SYN_STREAM.
  pub async fn open_stream(
    &self,
    headers: Headers,
    fin: bool,
  ) -> Result<(Arc<StreamShared>, mpsc::UnboundedReceiver<StreamEvent>)> {
    let mut next_sid = self.next_sid.lock().await;

    match self.state() {
      SessionState::Active => {}
      SessionState::GoingAway => return Err(TokioSpdyError::SessionClosed),
      SessionState::Closed => return Err(self.closed_err()),
    }

    let limit = self.peer_max_streams.load(Ordering::Acquire);
    if self.count_streams(true) >= limit as usize {
      return Err(TokioSpdyError::StreamLimitReached { limit });
    }

    // Check if stream id overflows.
    let sid = *next_sid;
    if sid > MAX_SID {
      self.go_away()?;
      return Err(TokioSpdyError::SessionGoAway);
    }
    *next_sid += 2;
    self.next_sid_hint.store(*next_sid, Ordering::Release);

    let state = StreamState::Opening {
      local_fin: fin,
      remote_fin: false,
    };
    let (stream, rx) = self.new_stream(sid, true, headers.clone(), state);

    let finish_rx = match self.enqueue(Frame::syn(sid, headers, fin)).await {
      Ok(rx) => rx,
      Err(err) => {
        self.forget(sid);
        return Err(err);
      }
    };
    drop(next_sid);

    if finish_rx.await.is_err() {
      self.forget(sid);
      return Err(self.closed_err());
    }
    Ok((stream, rx))
  }
}

/// Session is used to manage the underlying connection and provide multiplexing abilities.
///
/// Both ends may open streams. Clients use odd stream ids and servers even ones.
pub struct Session {
  shared: Arc<SessionShared>,
  accept_rx: Mutex<mpsc::Receiver<PendingStream>>,
  inner_join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Session {
  fn drop(&mut self) {
    // close all streams
    self.shared.terminate(TokioSpdyError::SessionClosed);
  }
}

impl Session {
  pub fn client<T: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
    conn: T,
    config: SpdyConfig,
  ) -> Result<Self> {
    Session::new(conn, config, true)
  }

  pub fn server<T: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
    conn: T,
    config: SpdyConfig,
  ) -> Result<Self> {
    Session::new(conn, config, false)
  }

  fn new<T: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
    conn: T,
    config: SpdyConfig,
    is_client: bool,
  ) -> Result<Self> {
    config.verify_config()?;

    let (write_tx, write_rx) = mpsc::channel(config.writing_frame_channel_capacity);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(MAX_READ_REQ);
    let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

    let keep_alive = match config.keep_alive_disable {
      true => None,
      false => Some((config.keep_alive_interval, config.keep_alive_timeout)),
    };
    let initial_settings = vec![
      Setting {
        id: setting::INITIAL_WINDOW_SIZE,
        value: config.initial_window_size,
      },
      Setting {
        id: setting::MAX_CONCURRENT_STREAMS,
        value: config.max_concurrent_streams,
      },
      Setting {
        id: setting::MAX_FRAME_SIZE,
        value: config.max_frame_size,
      },
    ];
    let session_window_size = config.session_window_size;

    let shared = Arc::new(SessionShared::new(config, is_client, write_tx, control_tx));

    // Announce settings, then widen the session window beyond the default.
    shared.send_control(Frame::settings(initial_settings));
    if session_window_size > DEFAULT_WINDOW {
      shared.send_control(Frame::window_update(0, session_window_size - DEFAULT_WINDOW));
    }

    // init SessionInner
    let mut inner = SessionInner::new(conn, shared.clone(), write_rx, control_rx, frame_tx);
    if let Some((interval, timeout)) = keep_alive {
      inner.with_keep_alive(interval, timeout);
    }
    let inner_join = tokio::spawn(async move {
      // The session is terminated with the error, see `inner_err()`.
      let _ = inner.run().await;
    });

    // init FrameRouter
    let mut router = FrameRouter::new(shared.clone(), frame_rx, accept_tx);
    tokio::spawn(async move {
      router.run().await;
    });

    Ok(Self {
      shared,
      accept_rx: Mutex::new(accept_rx),
      inner_join: Mutex::new(Some(inner_join)),
    })
  }

  pub fn state(&self) -> SessionState {
    self.shared.state()
  }

  pub fn is_closed(&self) -> bool {
    self.state() == SessionState::Closed
  }

  /// Get the error that ended the session, e.g. tcp connection failures or
  /// a protocol violation of the remote.
  pub fn inner_err(&self) -> Option<TokioSpdyError> {
    self.shared.inner_err()
  }

  /// Number of streams currently tracked by the session.
  pub fn num_streams(&self) -> usize {
    self.shared.streams.len()
  }

  /// Create a new `Stream` by sending a SYN_STREAM frame to the remote.
  ///
  /// Returns once the frame is written, without waiting for the reply. Use
  /// `Stream::wait()` for that.
  pub async fn create_stream(&self, headers: Headers, fin: bool) -> Result<Stream> {
    let (stream, inbound_rx) = self.shared.open_stream(headers, fin).await?;
    log::debug!("[session] open stream {}", stream.sid);
    Ok(Stream::new(stream, inbound_rx, self.shared.clone()))
  }

  /// Wait for the next stream opened by the remote.
  pub async fn accept_stream(&self) -> Result<Stream> {
    if self.shared.state() == SessionState::Closed {
      return Err(self.shared.closed_err());
    }

    let pending = self.accept_rx.lock().await.recv().await;
    match pending {
      Some(pending) => Ok(Stream::new(
        pending.stream,
        pending.inbound_rx,
        self.shared.clone(),
      )),
      None => Err(self.shared.closed_err()),
    }
  }

  /// Measure the round trip time with a PING frame.
  pub async fn ping(&self) -> Result<Duration> {
    if self.shared.state() == SessionState::Closed {
      return Err(self.shared.closed_err());
    }

    let id = self.shared.next_ping_id();
    let (tx, rx) = oneshot::channel();
    self.shared.pings.insert(id, tx);
    let start = Instant::now();
    self.shared.send_control(Frame::ping(id, false));

    rx.await.map_err(|_| self.shared.closed_err())?;
    Ok(start.elapsed())
  }

  /// Tell the remote no more streams will be created or accepted.
  pub fn go_away(&self) -> Result<()> {
    self.shared.go_away()
  }

  /// Send GOAWAY, reset every stream with `SessionClosed` and release the
  /// connection. Calling it again does nothing.
  pub async fn close(&self) {
    self.shared.terminate(TokioSpdyError::SessionClosed);

    let join = self.inner_join.lock().await.take();
    if let Some(join) = join {
      let _ = join.await;
    }
  }
}
