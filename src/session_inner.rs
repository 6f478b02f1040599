use std::future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TokioSpdyError};
use crate::frame::Frame;
use crate::session::SessionShared;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval};

pub(crate) struct WriteRequest {
  pub frame: Frame,
  pub finish_tx: Option<oneshot::Sender<()>>,
}

pub(crate) struct ReadRequest {
  pub frame: Frame,
}

// Hold the connection and handle low-level operations, like frames reading/writing.
// The transport is split so that a writer stuck on a full pipe never stops
// the reader from draining the remote, and the other way around.
pub(crate) struct SessionInner<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
  reader: FrameReader<T>,
  writer: FrameWriter<T>,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> SessionInner<T> {
  pub fn new(
    conn: T,
    shared: Arc<SessionShared>,
    write_rx: mpsc::Receiver<WriteRequest>,
    control_rx: mpsc::UnboundedReceiver<Frame>,
    recv_tx: mpsc::Sender<ReadRequest>,
  ) -> Self {
    let (read_half, write_half) = tokio::io::split(conn);
    let (last_read_tx, last_read_rx) = watch::channel(Instant::now());

    let reader = FrameReader {
      conn: read_half,
      close_rx: shared.subscribe_close(),
      shared: shared.clone(),
      recv_tx,
      read_buf: vec![],
      last_read: last_read_tx,
    };
    let writer = FrameWriter {
      conn: write_half,
      close_rx: shared.subscribe_close(),
      shared,
      write_rx,
      control_rx,
      keep_alive_ticker: None,
      keep_alive_timeout: Duration::ZERO,
      last_read: last_read_rx,
    };
    Self { reader, writer }
  }

  /// Ping the remote every `interval` and give up once nothing was read for `timeout`.
  pub fn with_keep_alive(&mut self, interval: Duration, timeout: Duration) {
    self.writer.keep_alive_ticker = Some(time::interval_at(Instant::now() + interval, interval));
    self.writer.keep_alive_timeout = timeout;
  }

  /// Serve the connection until the session is closed or fails. Whatever
  /// ends either half also terminates the session, which stops the other.
  pub async fn run(&mut self) -> Result<()> {
    let (read_res, write_res) = tokio::join!(self.reader.run(), self.writer.run());
    read_res.and(write_res)
  }
}

fn stop_session(shared: &SessionShared, res: &Result<()>) {
  match res {
    Ok(()) => shared.terminate(TokioSpdyError::SessionClosed),
    Err(err) => shared.terminate(err.clone()),
  }
}

// The only reader of the connection. Decodes frames and hands them to the router.
struct FrameReader<T> {
  conn: ReadHalf<T>,
  shared: Arc<SessionShared>,

  // Receive close request and stop reading.
  close_rx: broadcast::Receiver<()>,

  // Send new frames to the router.
  recv_tx: mpsc::Sender<ReadRequest>,

  read_buf: Vec<u8>,

  // Seen by the writer's keep-alive check.
  last_read: watch::Sender<Instant>,
}

impl<T: AsyncRead + Send + Unpin + 'static> FrameReader<T> {
  async fn run(&mut self) -> Result<()> {
    let res = self.run_inner().await;
    stop_session(&self.shared, &res);
    res
  }

  // Should return Err only when the error is not recoverable.
  async fn run_inner(&mut self) -> Result<()> {
    let mut data: Vec<u8> = vec![0; 65535];

    // NOTE: Always ensure the cancel safety.
    loop {
      tokio::select! {
        biased;
        _ = self.close_rx.recv() => {
          break; // don't loop anymore when closed
        }
        size = self.conn.read(&mut data) => {
          let size = size?;
          if size == 0 {
            log::debug!("[session] remote closed the connection");
            break;
          }
          self.last_read.send_replace(Instant::now());
          self.handle_read_data(&data[0..size]).await?;
        }
      }
    }

    Ok(())
  }

  async fn handle_read_data(&mut self, data: &[u8]) -> Result<()> {
    self.read_buf.extend_from_slice(data);

    let mut pos = 0;
    let res = loop {
      match Frame::decode(&self.read_buf[pos..]) {
        Ok((frame, used)) => {
          pos += used;
          log::trace!("[session] read {:?} frame, sid: {}", frame.cmd(), frame.sid);
          // Will block if the router falls behind.
          if self.recv_tx.send(ReadRequest { frame }).await.is_err() {
            break Err(TokioSpdyError::SessionClosed);
          }
        }
        // not enough data
        Err(err) if err.is_retryable() => break Ok(()),
        Err(err) => break Err(err),
      }
    };

    self.read_buf.drain(..pos);
    res
  }
}

// The only writer of the connection. Control frames skip the line of data
// frames, keep-alive pings are sent from here too.
struct FrameWriter<T> {
  conn: WriteHalf<T>,
  shared: Arc<SessionShared>,

  // Receive close request and stop the connection.
  close_rx: broadcast::Receiver<()>,

  // Receive write requests of streams and handle writing.
  write_rx: mpsc::Receiver<WriteRequest>,

  // Session level frames (SETTINGS, PING, GOAWAY, RST_STREAM, WINDOW_UPDATE).
  control_rx: mpsc::UnboundedReceiver<Frame>,

  keep_alive_ticker: Option<Interval>,
  keep_alive_timeout: Duration,
  last_read: watch::Receiver<Instant>,
}

impl<T: AsyncWrite + Send + Unpin + 'static> FrameWriter<T> {
  async fn run(&mut self) -> Result<()> {
    let res = self.run_inner().await;
    stop_session(&self.shared, &res);

    // A broken transport can't carry the GOAWAY anyway.
    if !matches!(res, Err(TokioSpdyError::Io { .. })) {
      self.handle_before_stop().await;
    }
    res
  }

  async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
      Some(ticker) => {
        ticker.tick().await;
      }
      None => future::pending::<()>().await,
    }
  }

  async fn run_inner(&mut self) -> Result<()> {
    // NOTE: Always ensure the cancel safety.
    loop {
      tokio::select! {
        biased;
        _ = self.close_rx.recv() => {
          break;
        }
        Some(frame) = self.control_rx.recv() => {
          self.write_frame(&frame).await?;
        }
        req = self.write_rx.recv() => {
          match req {
            Some(req) => self.handle_write_req(req).await?,
            // Write_rx is closed, means the session is removed.
            None => break,
          }
        }
        _ = FrameWriter::<T>::tick(&mut self.keep_alive_ticker) => {
          self.handle_keep_alive().await?;
        }
      }
    }

    Ok(())
  }

  async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
    log::trace!("[session] write {:?} frame, sid: {}", frame.cmd(), frame.sid);
    self.conn.write_all(&frame.encode()).await?;
    self.conn.flush().await?;
    Ok(())
  }

  async fn handle_write_req(&mut self, req: WriteRequest) -> Result<()> {
    self.write_frame(&req.frame).await?;

    if let Some(finish_tx) = req.finish_tx {
      // The writer may have given up waiting, that's fine.
      let _ = finish_tx.send(());
    }
    Ok(())
  }

  async fn handle_keep_alive(&mut self) -> Result<()> {
    let idle = self.last_read.borrow().elapsed();
    if idle >= self.keep_alive_timeout {
      return Err(TokioSpdyError::KeepAliveTimeout);
    }

    let ping = Frame::ping(self.shared.next_ping_id(), false);
    self.write_frame(&ping).await
  }

  // Flush frames queued while closing, like GOAWAY, then release the connection.
  async fn handle_before_stop(&mut self) {
    while let Ok(frame) = self.control_rx.try_recv() {
      if self.write_frame(&frame).await.is_err() {
        break;
      }
    }
    let _ = self.conn.shutdown().await;
  }
}
