use crate::error::{Result, TokioSpdyError};
use crate::frame::{status, Body, Frame, Setting, Sid};
use crate::headers::Headers;
use crate::session::{SessionShared, SessionState};
use crate::session_inner::ReadRequest;
use crate::stream::{StreamEvent, StreamShared, StreamState};
use crate::window;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A remote-initiated stream waiting for `Session::accept_stream()`.
pub(crate) struct PendingStream {
  pub stream: Arc<StreamShared>,
  pub inbound_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

// Consume reading frames in transport order and dispatch them:
// - SYN frames become pending streams for `accept_stream`
// - REPLY, DATA, RST and WINDOW_UPDATE frames go to their stream by sid
// - SETTINGS, PING and GOAWAY are session level
//
// Every answer goes through the control queue so the router never waits
// behind data frames.
pub(crate) struct FrameRouter {
  shared: Arc<SessionShared>,

  // Closed by the I/O task to stop the running.
  new_frame_rx: mpsc::Receiver<ReadRequest>,

  accept_tx: mpsc::Sender<PendingStream>,
}

fn violation(msg: String) -> TokioSpdyError {
  TokioSpdyError::ProtocolViolation { msg }
}

impl FrameRouter {
  pub fn new(
    shared: Arc<SessionShared>,
    new_frame_rx: mpsc::Receiver<ReadRequest>,
    accept_tx: mpsc::Sender<PendingStream>,
  ) -> Self {
    Self {
      shared,
      new_frame_rx,
      accept_tx,
    }
  }

  pub async fn run(&mut self) {
    while let Some(read_req) = self.new_frame_rx.recv().await {
      if let Err(err) = self.on_frame_received(read_req.frame) {
        log::warn!("[router] stop routing: {}", err);
        self.shared.terminate(err);
        break;
      }
    }
    // Connection closed, exit.
  }

  fn on_frame_received(&mut self, frame: Frame) -> Result<()> {
    let sid = frame.sid;
    let fin = frame.is_fin();
    let ack = frame.is_ack();

    match frame.body {
      Body::Syn(headers) => self.handle_syn(sid, headers, fin),
      Body::Reply(headers) => self.handle_reply(sid, headers, fin),
      Body::Data(data) => self.handle_data(sid, data, fin),
      Body::Rst { status } => {
        self.handle_rst(sid, status);
        Ok(())
      }
      Body::Settings(settings) => self.handle_settings(settings, ack),
      Body::Ping { id } => {
        self.handle_ping(id, ack);
        Ok(())
      }
      Body::GoAway { last_sid, status } => {
        self.shared.on_go_away(last_sid, status);
        Ok(())
      }
      Body::WindowUpdate { delta } => self.handle_window_update(sid, delta),
    }
  }

  fn refuse(&self, sid: Sid) {
    log::debug!("[router] refuse stream {}", sid);
    self
      .shared
      .send_control(Frame::rst(sid, status::REFUSED_STREAM));
  }

  fn handle_syn(&mut self, sid: Sid, headers: Headers, fin: bool) -> Result<()> {
    if self.shared.streams.contains_key(&sid) {
      return Err(TokioSpdyError::DuplicateStream { sid });
    }
    if sid == 0 || self.shared.is_local_sid(sid) {
      return Err(violation(format!("remote opens stream {} of our parity", sid)));
    }
    if sid <= self.shared.last_remote_sid() {
      return Err(violation(format!("remote reuses stream id {}", sid)));
    }
    self.shared.set_last_remote_sid(sid);

    if self.shared.state() != SessionState::Active
      || self.shared.count_streams(false) >= self.shared.config.max_concurrent_streams as usize
    {
      self.refuse(sid);
      return Ok(());
    }

    let opening = StreamState::Opening {
      local_fin: false,
      remote_fin: false,
    };
    let (stream, inbound_rx) = self.shared.new_stream(sid, false, headers, opening);
    if fin {
      stream.on_remote_fin();
    }

    let pending = PendingStream { stream, inbound_rx };
    if let Err(err) = self.accept_tx.try_send(pending) {
      // Backlog full, or nobody accepts anymore.
      let pending = match err {
        mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
      };
      let err = TokioSpdyError::StreamReset {
        sid,
        status: status::REFUSED_STREAM,
      };
      self.shared.reset_stream(&pending.stream, err);
      self.refuse(sid);
      return Ok(());
    }

    log::debug!("[router] accept stream {}", sid);
    Ok(())
  }

  fn handle_reply(&mut self, sid: Sid, headers: Headers, fin: bool) -> Result<()> {
    if !self.shared.is_local_sid(sid) || !self.shared.was_opened(sid) {
      return Err(violation(format!("reply for stream {} we never opened", sid)));
    }

    let Some(stream) = self.shared.get_stream(sid) else {
      log::debug!("[router] reply for removed stream {}", sid);
      return Ok(());
    };

    match stream.on_reply(headers, fin) {
      Some(next) => {
        if next.is_terminal() {
          self.shared.forget(sid);
        }
        Ok(())
      }
      None => Err(violation(format!(
        "reply for stream {} in state {:?}",
        sid,
        stream.state()
      ))),
    }
  }

  fn handle_data(&mut self, sid: Sid, data: Vec<u8>, fin: bool) -> Result<()> {
    let len = data.len();

    let Some(stream) = self.shared.get_stream(sid) else {
      if !self.shared.was_opened(sid) {
        return Err(violation(format!("data for unopened stream {}", sid)));
      }
      window::lock(&self.shared.recv_window).on_data_received(len)?;
      self.discard(sid, len, status::STREAM_ALREADY_CLOSED);
      return Ok(());
    };

    window::lock(&self.shared.recv_window).on_data_received(len)?;

    if !stream.state().can_receive() {
      self.discard(sid, len, status::STREAM_ALREADY_CLOSED);
      self.reset(&stream, status::STREAM_ALREADY_CLOSED);
      return Ok(());
    }

    window::lock(&stream.recv_window).on_data_received(len)?;

    if len > 0 && !stream.push_data(data) {
      // The handle is gone, nobody reads this stream anymore.
      self.discard(sid, len, status::CANCEL);
      self.reset(&stream, status::CANCEL);
      return Ok(());
    }

    if fin {
      let next = stream.on_remote_fin();
      log::debug!("[router] stream {} remote fin, state {:?}", sid, next);
      if next.is_terminal() {
        self.shared.forget(sid);
      }
    }
    Ok(())
  }

  // Hand the session credit of dropped data back to the remote and answer with RST.
  fn discard(&self, sid: Sid, len: usize, code: u32) {
    log::debug!("[router] discard {} bytes of stream {}", len, sid);
    self.shared.on_data_consumed(len);
    self.shared.send_control(Frame::rst(sid, code));
  }

  fn reset(&self, stream: &StreamShared, code: u32) {
    let err = TokioSpdyError::StreamReset {
      sid: stream.sid,
      status: code,
    };
    self.shared.reset_stream(stream, err);
  }

  fn handle_rst(&mut self, sid: Sid, code: u32) {
    match self.shared.get_stream(sid) {
      Some(stream) => {
        log::debug!("[router] stream {} reset by remote, status {}", sid, code);
        self.reset(&stream, code);
      }
      None => {
        log::debug!("[router] ignore rst of unknown stream {}", sid);
      }
    }
  }

  fn handle_settings(&mut self, settings: Vec<Setting>, ack: bool) -> Result<()> {
    if ack {
      self.shared.on_settings_acked();
      return Ok(());
    }

    self.shared.apply_settings(&settings)?;
    self.shared.send_control(Frame::settings_ack());
    Ok(())
  }

  fn handle_ping(&mut self, id: u32, ack: bool) {
    if !ack {
      self.shared.send_control(Frame::ping(id, true));
      return;
    }

    match self.shared.pings.remove(&id) {
      Some((_, tx)) => {
        let _ = tx.send(());
      }
      // Keep-alive pings have no waiter.
      None => log::trace!("[router] ping ack {}", id),
    }
  }

  fn handle_window_update(&mut self, sid: Sid, delta: u32) -> Result<()> {
    if sid == 0 {
      return self.shared.send_window.grant(delta);
    }

    match self.shared.get_stream(sid) {
      Some(stream) => stream.send_window.grant(delta),
      None => {
        log::trace!("[router] ignore window update of unknown stream {}", sid);
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod test {
  use crate::frame::{setting, status, Body, Frame, Setting, Sid};
  use crate::frame_router::{FrameRouter, PendingStream};
  use crate::headers::Headers;
  use crate::session::test::test_spdy_config;
  use crate::session::SessionShared;
  use crate::session_inner::ReadRequest;
  use crate::stream::{StreamEvent, StreamState};
  use crate::{SpdyConfig, TokioSpdyError};
  use std::sync::Arc;
  use tokio::sync::mpsc;
  use tokio::task::JoinHandle;

  struct Harness {
    shared: Arc<SessionShared>,
    new_frame_tx: mpsc::Sender<ReadRequest>,
    control_rx: mpsc::UnboundedReceiver<Frame>,
    accept_rx: mpsc::Receiver<PendingStream>,
    join: JoinHandle<()>,
  }

  impl Harness {
    fn new(config: SpdyConfig, is_client: bool) -> Self {
      let (write_tx, mut write_rx) = mpsc::channel(16);
      let (control_tx, control_rx) = mpsc::unbounded_channel();
      let (new_frame_tx, new_frame_rx) = mpsc::channel(16);
      let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
      let shared = Arc::new(SessionShared::new(config, is_client, write_tx, control_tx));

      let mut router = FrameRouter::new(shared.clone(), new_frame_rx, accept_tx);
      let join = tokio::spawn(async move {
        router.run().await;
      });
      // stand-in for the I/O task, completes every write
      tokio::spawn(async move {
        while let Some(req) = write_rx.recv().await {
          let req: crate::session_inner::WriteRequest = req;
          if let Some(finish_tx) = req.finish_tx {
            let _ = finish_tx.send(());
          }
        }
      });

      Self {
        shared,
        new_frame_tx,
        control_rx,
        accept_rx,
        join,
      }
    }

    async fn send(&self, frame: Frame) {
      self.new_frame_tx.send(ReadRequest { frame }).await.unwrap();
    }

    async fn control(&mut self) -> Frame {
      self.control_rx.recv().await.unwrap()
    }

    // Wait until the router stopped on a fatal error.
    async fn fatal(self) -> TokioSpdyError {
      self.join.await.unwrap();
      self.shared.inner_err().unwrap()
    }
  }

  fn syn(sid: Sid, fin: bool) -> Frame {
    Frame::syn(sid, [("k", "v")].into_iter().collect(), fin)
  }

  #[tokio::test]
  async fn test_router_syn_and_data() {
    let mut h = Harness::new(test_spdy_config(), false);

    h.send(syn(1, false)).await;
    h.send(Frame::data(1, vec![1, 2, 3], false)).await;
    h.send(Frame::data(1, vec![], true)).await;

    let mut pending = h.accept_rx.recv().await.unwrap();
    assert_eq!(pending.stream.sid, 1);
    assert_eq!(pending.stream.headers.get("k"), Some("v"));
    assert!(!pending.stream.local);

    assert!(matches!(
      pending.inbound_rx.recv().await,
      Some(StreamEvent::Data(d)) if d == vec![1, 2, 3]
    ));
    assert!(matches!(pending.inbound_rx.recv().await, Some(StreamEvent::Fin)));
    assert_eq!(
      pending.stream.state(),
      StreamState::Opening {
        local_fin: false,
        remote_fin: true,
      }
    );

    // syn carrying fin is already half closed by the remote
    h.send(syn(3, true)).await;
    let mut pending = h.accept_rx.recv().await.unwrap();
    assert!(matches!(pending.inbound_rx.recv().await, Some(StreamEvent::Fin)));

    // reusing a live id
    h.send(syn(1, false)).await;
    assert!(matches!(h.fatal().await, TokioSpdyError::DuplicateStream { sid: 1 }));
  }

  #[tokio::test]
  async fn test_router_syn_errors() {
    let h = Harness::new(test_spdy_config(), false);
    h.send(syn(2, false)).await;
    assert!(matches!(h.fatal().await, TokioSpdyError::ProtocolViolation { .. }));

    let h = Harness::new(test_spdy_config(), false);
    h.send(syn(5, false)).await;
    h.send(syn(3, false)).await;
    assert!(matches!(h.fatal().await, TokioSpdyError::ProtocolViolation { .. }));
  }

  #[tokio::test]
  async fn test_router_refuses_streams() {
    let mut config = test_spdy_config();
    config.accept_backlog = 1;
    let mut h = Harness::new(config, false);

    h.send(syn(1, false)).await;
    h.send(syn(3, false)).await;
    assert_eq!(h.control().await, Frame::rst(3, status::REFUSED_STREAM));
    assert_eq!(h.shared.streams.len(), 1);

    let mut config = test_spdy_config();
    config.max_concurrent_streams = 1;
    let mut h = Harness::new(config, false);
    h.send(syn(1, false)).await;
    h.send(syn(3, false)).await;
    assert_eq!(h.control().await, Frame::rst(3, status::REFUSED_STREAM));

    // no new streams while going away
    h.shared.go_away().unwrap();
    assert!(matches!(h.control().await.body, Body::GoAway { .. }));
    h.send(syn(5, false)).await;
    assert_eq!(h.control().await, Frame::rst(5, status::REFUSED_STREAM));
  }

  #[tokio::test]
  async fn test_router_data_rules() {
    let mut h = Harness::new(test_spdy_config(), false);

    h.send(syn(1, false)).await;
    h.send(syn(3, false)).await;
    let first = h.accept_rx.recv().await.unwrap();
    let second = h.accept_rx.recv().await.unwrap();

    // nobody reads stream 1 anymore
    drop(first.inbound_rx);
    h.send(Frame::data(1, vec![0; 10], false)).await;
    assert_eq!(h.control().await, Frame::rst(1, status::CANCEL));
    assert_eq!(first.stream.state(), StreamState::Reset);

    // stream 1 is gone now
    h.send(Frame::data(1, vec![0; 10], false)).await;
    assert_eq!(h.control().await, Frame::rst(1, status::STREAM_ALREADY_CLOSED));

    // data after the remote fin
    h.send(Frame::data(3, vec![], true)).await;
    h.send(Frame::data(3, vec![1], false)).await;
    assert_eq!(h.control().await, Frame::rst(3, status::STREAM_ALREADY_CLOSED));
    assert_eq!(second.stream.state(), StreamState::Reset);
    assert_eq!(h.shared.streams.len(), 0);

    // never opened
    h.send(Frame::data(7, vec![1], false)).await;
    assert!(matches!(h.fatal().await, TokioSpdyError::ProtocolViolation { .. }));
  }

  #[tokio::test]
  async fn test_router_reply_and_rst() {
    let h = Harness::new(test_spdy_config(), true);

    let (stream, mut inbound_rx) = h.shared.open_stream(Headers::new(), false).await.unwrap();
    assert_eq!(stream.sid, 1);

    h.send(Frame::reply(1, [("status", "200")].into_iter().collect(), true))
      .await;
    assert!(matches!(inbound_rx.recv().await, Some(StreamEvent::Fin)));
    assert_eq!(stream.state(), StreamState::HalfClosedRemote);

    h.send(Frame::rst(1, status::INTERNAL_ERROR)).await;
    assert!(matches!(
      inbound_rx.recv().await,
      Some(StreamEvent::Reset(TokioSpdyError::StreamReset {
        sid: 1,
        status: status::INTERNAL_ERROR,
      }))
    ));
    assert_eq!(h.shared.streams.len(), 0);

    // unknown rst is ignored, reply for a stream the remote opened is not
    h.send(Frame::rst(9, status::CANCEL)).await;
    h.send(Frame::reply(2, Headers::new(), false)).await;
    assert!(matches!(h.fatal().await, TokioSpdyError::ProtocolViolation { .. }));
  }

  #[tokio::test]
  async fn test_router_session_frames() {
    let mut h = Harness::new(test_spdy_config(), true);

    let (stream, _inbound_rx) = h.shared.open_stream(Headers::new(), false).await.unwrap();
    assert_eq!(stream.send_window.available(), 64 * 1024);

    h.send(Frame::settings(vec![
      Setting {
        id: setting::INITIAL_WINDOW_SIZE,
        value: 1000,
      },
      Setting {
        id: setting::MAX_FRAME_SIZE,
        value: 512,
      },
    ]))
    .await;
    assert_eq!(h.control().await, Frame::settings_ack());
    assert_eq!(stream.send_window.available(), 1000);
    assert_eq!(h.shared.max_frame_size(), 512);

    h.send(Frame::window_update(1, 24)).await;
    h.send(Frame::window_update(0, 100)).await;
    h.send(Frame::ping(4, false)).await;
    assert_eq!(h.control().await, Frame::ping(4, true));
    assert_eq!(stream.send_window.available(), 1024);
    assert_eq!(h.shared.send_window.available(), 64 * 1024 + 100);

    // ack resolves the waiting ping
    let (tx, rx) = tokio::sync::oneshot::channel();
    h.shared.pings.insert(7, tx);
    h.send(Frame::ping(7, true)).await;
    rx.await.unwrap();

    // goaway resets local streams the remote never processed
    h.send(Frame::go_away(0, status::OK)).await;
    h.send(Frame::ping(6, false)).await;
    assert_eq!(h.control().await, Frame::ping(6, true));
    assert_eq!(stream.state(), StreamState::Reset);
    assert_eq!(
      h.shared.state(),
      crate::session::SessionState::GoingAway
    );

    // window overflow is fatal
    h.send(Frame::window_update(0, i32::MAX as u32)).await;
    assert!(matches!(h.fatal().await, TokioSpdyError::ProtocolViolation { .. }));
  }
}
