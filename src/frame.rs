use crate::error::{Result, TokioSpdyError};
use crate::headers::Headers;
use byteorder::{BigEndian, ByteOrder};

pub type Sid = u32;

pub const VERSION: u8 = 3;

// sizeOfVer      = 1
// sizeOfCmd      = 1
// sizeOfFlags    = 1
// sizeOfReserved = 1
// sizeOfLength   = 4
// sizeOfSid      = 4
pub const HEADER_SIZE: usize = 12;

/// Largest payload a frame may declare.
pub const MAX_FRAME_LENGTH: u32 = 0x00FF_FFFF;

pub mod flags {
  // Last frame the sender emits on this stream.
  pub const FIN: u8 = 0x01;
  // Answer to a PING or SETTINGS frame.
  pub const ACK: u8 = 0x02;
}

/// Status codes carried by RST_STREAM and GOAWAY frames.
pub mod status {
  pub const OK: u32 = 0;
  pub const PROTOCOL_ERROR: u32 = 1;
  pub const INVALID_STREAM: u32 = 2;
  pub const REFUSED_STREAM: u32 = 3;
  pub const CANCEL: u32 = 4;
  pub const INTERNAL_ERROR: u32 = 5;
  pub const FLOW_CONTROL_ERROR: u32 = 6;
  pub const STREAM_IN_USE: u32 = 7;
  pub const STREAM_ALREADY_CLOSED: u32 = 8;
}

pub mod setting {
  pub const INITIAL_WINDOW_SIZE: u16 = 1;
  pub const MAX_CONCURRENT_STREAMS: u16 = 2;
  pub const MAX_FRAME_SIZE: u16 = 3;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmd {
  // data push
  Data,
  // stream open, carries headers
  Syn,
  // stream open acknowledged, carries headers
  Reply,
  // abort a stream
  Rst,
  Settings,
  Ping,
  // no more streams will be accepted
  GoAway,
  // grant more send credit
  WindowUpdate,
}

impl TryFrom<u8> for Cmd {
  type Error = TokioSpdyError;

  fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
    let val = match value {
      0 => Cmd::Data,
      1 => Cmd::Syn,
      2 => Cmd::Reply,
      3 => Cmd::Rst,
      4 => Cmd::Settings,
      5 => Cmd::Ping,
      6 => Cmd::GoAway,
      7 => Cmd::WindowUpdate,
      _ => return Err(malformed(format!("unknown cmd {}", value))),
    };

    Ok(val)
  }
}

impl From<Cmd> for u8 {
  fn from(cmd: Cmd) -> u8 {
    match cmd {
      Cmd::Data => 0,
      Cmd::Syn => 1,
      Cmd::Reply => 2,
      Cmd::Rst => 3,
      Cmd::Settings => 4,
      Cmd::Ping => 5,
      Cmd::GoAway => 6,
      Cmd::WindowUpdate => 7,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Setting {
  pub id: u16,
  pub value: u32,
}

/// Typed payload of a frame. The variant decides the wire cmd.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
  Data(Vec<u8>),
  Syn(Headers),
  Reply(Headers),
  Rst { status: u32 },
  Settings(Vec<Setting>),
  Ping { id: u32 },
  GoAway { last_sid: Sid, status: u32 },
  WindowUpdate { delta: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
  pub ver: u8,
  pub flags: u8,
  pub sid: Sid,
  pub body: Body,
}

/// The fixed-size part of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
  pub ver: u8,
  pub cmd: Cmd,
  pub flags: u8,
  pub length: u32,
  pub sid: Sid,
}

impl FrameHeader {
  /// Parse and validate a header. Returns `Truncated` if fewer than
  /// `HEADER_SIZE` bytes are given.
  pub fn parse(data: &[u8]) -> Result<Self> {
    if data.len() < HEADER_SIZE {
      return Err(TokioSpdyError::Truncated {
        needed: HEADER_SIZE - data.len(),
      });
    }

    let ver = data[0];
    if ver != VERSION {
      return Err(malformed(format!("unsupported version {}", ver)));
    }
    let cmd = Cmd::try_from(data[1])?;
    let flags = data[2];
    if data[3] != 0 {
      return Err(malformed("reserved byte is not zero"));
    }
    let length = BigEndian::read_u32(&data[4..8]);
    let sid = BigEndian::read_u32(&data[8..12]);

    let header = Self {
      ver,
      cmd,
      flags,
      length,
      sid,
    };
    header.validate()?;
    Ok(header)
  }

  fn validate(&self) -> Result<()> {
    if self.length > MAX_FRAME_LENGTH {
      return Err(malformed(format!("impossible length {}", self.length)));
    }

    let allowed_flags = match self.cmd {
      Cmd::Data | Cmd::Syn | Cmd::Reply => flags::FIN,
      Cmd::Settings | Cmd::Ping => flags::ACK,
      _ => 0,
    };
    if self.flags & !allowed_flags != 0 {
      return Err(malformed(format!(
        "flags {:#x} not allowed on {:?}",
        self.flags, self.cmd
      )));
    }

    match self.cmd {
      Cmd::Data | Cmd::Syn | Cmd::Reply | Cmd::Rst if self.sid == 0 => {
        return Err(malformed(format!("{:?} on stream 0", self.cmd)));
      }
      Cmd::Settings | Cmd::Ping | Cmd::GoAway if self.sid != 0 => {
        return Err(malformed(format!("{:?} on stream {}", self.cmd, self.sid)));
      }
      _ => {}
    }

    let length_ok = match self.cmd {
      Cmd::Rst | Cmd::Ping | Cmd::WindowUpdate => self.length == 4,
      Cmd::GoAway => self.length == 8,
      Cmd::Settings if self.flags & flags::ACK != 0 => self.length == 0,
      Cmd::Settings => self.length % 6 == 0,
      Cmd::Syn | Cmd::Reply => self.length >= 4,
      Cmd::Data => true,
    };
    if !length_ok {
      return Err(malformed(format!(
        "length {} invalid for {:?}",
        self.length, self.cmd
      )));
    }

    Ok(())
  }

  fn write_to(&self, buf: &mut [u8]) {
    buf[0] = self.ver;
    buf[1] = self.cmd.into();
    buf[2] = self.flags;
    buf[3] = 0;
    BigEndian::write_u32(&mut buf[4..8], self.length);
    BigEndian::write_u32(&mut buf[8..12], self.sid);
  }
}

impl Frame {
  pub fn new(sid: Sid, flags: u8, body: Body) -> Self {
    Self {
      ver: VERSION,
      flags,
      sid,
      body,
    }
  }

  pub fn data(sid: Sid, data: Vec<u8>, fin: bool) -> Self {
    Self::new(sid, fin_flag(fin), Body::Data(data))
  }

  pub fn syn(sid: Sid, headers: Headers, fin: bool) -> Self {
    Self::new(sid, fin_flag(fin), Body::Syn(headers))
  }

  pub fn reply(sid: Sid, headers: Headers, fin: bool) -> Self {
    Self::new(sid, fin_flag(fin), Body::Reply(headers))
  }

  pub fn rst(sid: Sid, status: u32) -> Self {
    Self::new(sid, 0, Body::Rst { status })
  }

  pub fn settings(settings: Vec<Setting>) -> Self {
    Self::new(0, 0, Body::Settings(settings))
  }

  pub fn settings_ack() -> Self {
    Self::new(0, flags::ACK, Body::Settings(vec![]))
  }

  pub fn ping(id: u32, ack: bool) -> Self {
    let flags = if ack { flags::ACK } else { 0 };
    Self::new(0, flags, Body::Ping { id })
  }

  pub fn go_away(last_sid: Sid, status: u32) -> Self {
    Self::new(0, 0, Body::GoAway { last_sid, status })
  }

  pub fn window_update(sid: Sid, delta: u32) -> Self {
    Self::new(sid, 0, Body::WindowUpdate { delta })
  }

  pub fn cmd(&self) -> Cmd {
    match self.body {
      Body::Data(_) => Cmd::Data,
      Body::Syn(_) => Cmd::Syn,
      Body::Reply(_) => Cmd::Reply,
      Body::Rst { .. } => Cmd::Rst,
      Body::Settings(_) => Cmd::Settings,
      Body::Ping { .. } => Cmd::Ping,
      Body::GoAway { .. } => Cmd::GoAway,
      Body::WindowUpdate { .. } => Cmd::WindowUpdate,
    }
  }

  pub fn is_fin(&self) -> bool {
    self.flags & flags::FIN != 0
  }

  pub fn is_ack(&self) -> bool {
    self.flags & flags::ACK != 0
  }

  fn payload_len(&self) -> usize {
    match &self.body {
      Body::Data(data) => data.len(),
      Body::Syn(headers) | Body::Reply(headers) => headers.encoded_len(),
      Body::Settings(settings) => settings.len() * 6,
      Body::GoAway { .. } => 8,
      Body::Rst { .. } | Body::Ping { .. } | Body::WindowUpdate { .. } => 4,
    }
  }

  /// Serialize the frame. The payload must not exceed `MAX_FRAME_LENGTH`.
  pub fn encode(&self) -> Vec<u8> {
    let length = self.payload_len();
    debug_assert!(length <= MAX_FRAME_LENGTH as usize);

    let mut buf: Vec<u8> = vec![0; HEADER_SIZE + length];
    let header = FrameHeader {
      ver: self.ver,
      cmd: self.cmd(),
      flags: self.flags,
      length: length as u32,
      sid: self.sid,
    };
    header.write_to(&mut buf[..HEADER_SIZE]);

    let payload = &mut buf[HEADER_SIZE..];
    match &self.body {
      Body::Data(data) => payload.copy_from_slice(data),
      Body::Syn(headers) | Body::Reply(headers) => headers.encode_into(payload),
      Body::Settings(settings) => {
        for (i, s) in settings.iter().enumerate() {
          BigEndian::write_u16(&mut payload[i * 6..i * 6 + 2], s.id);
          BigEndian::write_u32(&mut payload[i * 6 + 2..i * 6 + 6], s.value);
        }
      }
      Body::GoAway { last_sid, status } => {
        BigEndian::write_u32(&mut payload[0..4], *last_sid);
        BigEndian::write_u32(&mut payload[4..8], *status);
      }
      Body::Rst { status: value }
      | Body::Ping { id: value }
      | Body::WindowUpdate { delta: value } => BigEndian::write_u32(payload, *value),
    }

    buf
  }

  /// Decode one frame from the front of `data`, returning it with the number
  /// of bytes consumed.
  ///
  /// `Truncated` means the buffer holds a valid prefix and decoding should be
  /// retried once more bytes arrive.
  pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
    let header = FrameHeader::parse(data)?;
    let total = HEADER_SIZE + header.length as usize;
    if data.len() < total {
      return Err(TokioSpdyError::Truncated {
        needed: total - data.len(),
      });
    }

    let payload = &data[HEADER_SIZE..total];
    let body = match header.cmd {
      Cmd::Data => Body::Data(payload.to_vec()),
      Cmd::Syn => Body::Syn(Headers::decode(payload)?),
      Cmd::Reply => Body::Reply(Headers::decode(payload)?),
      Cmd::Rst => Body::Rst {
        status: BigEndian::read_u32(payload),
      },
      Cmd::Settings => Body::Settings(
        payload
          .chunks_exact(6)
          .map(|c| Setting {
            id: BigEndian::read_u16(&c[0..2]),
            value: BigEndian::read_u32(&c[2..6]),
          })
          .collect(),
      ),
      Cmd::Ping => Body::Ping {
        id: BigEndian::read_u32(payload),
      },
      Cmd::GoAway => Body::GoAway {
        last_sid: BigEndian::read_u32(&payload[0..4]),
        status: BigEndian::read_u32(&payload[4..8]),
      },
      Cmd::WindowUpdate => {
        let delta = BigEndian::read_u32(payload);
        if delta == 0 || delta > i32::MAX as u32 {
          return Err(malformed(format!("invalid window delta {}", delta)));
        }
        Body::WindowUpdate { delta }
      }
    };

    let frame = Frame {
      ver: header.ver,
      flags: header.flags,
      sid: header.sid,
      body,
    };
    Ok((frame, total))
  }
}

fn fin_flag(fin: bool) -> u8 {
  if fin {
    flags::FIN
  } else {
    0
  }
}

fn malformed(msg: impl Into<String>) -> TokioSpdyError {
  TokioSpdyError::MalformedFrame { msg: msg.into() }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_frame_header() {
    let data: Vec<u8> = vec![
      3, // version
      0, // cmd
      1, // flags
      0, // reserved
      0, 0, 0, 5, // length
      0, 0, 0, 1, // sid
    ];

    let header = FrameHeader::parse(&data).unwrap();
    assert_eq!(header.ver, 3);
    assert_eq!(header.cmd, Cmd::Data);
    assert_eq!(header.flags, flags::FIN);
    assert_eq!(header.length, 5);
    assert_eq!(header.sid, 1);

    // not enough length
    let res = FrameHeader::parse(&data[0..1]);
    assert_eq!(res, Err(TokioSpdyError::Truncated { needed: 11 }));

    // body still missing
    let res = Frame::decode(&data);
    assert_eq!(res, Err(TokioSpdyError::Truncated { needed: 5 }));
  }

  #[test]
  fn test_frame_data() {
    let frame = Frame::data(1, b"Writing to stream".to_vec(), true);
    let buf = frame.encode();
    assert_eq!(buf.len(), HEADER_SIZE + 17);

    let (decoded, used) = Frame::decode(&buf).unwrap();
    assert_eq!(used, buf.len());
    assert_eq!(decoded, frame);
    assert!(decoded.is_fin());
    assert_eq!(decoded.encode(), buf);
  }

  #[test]
  fn test_frame_every_cmd() {
    let headers: Headers = [(":method", "POST"), (":path", "/")].into_iter().collect();
    let frames = vec![
      Frame::data(3, vec![], false),
      Frame::syn(1, headers.clone(), false),
      Frame::reply(1, headers, true),
      Frame::rst(5, status::CANCEL),
      Frame::settings(vec![
        Setting {
          id: setting::INITIAL_WINDOW_SIZE,
          value: 256,
        },
        Setting { id: 99, value: 7 },
      ]),
      Frame::settings_ack(),
      Frame::ping(7, false),
      Frame::ping(7, true),
      Frame::go_away(9, status::PROTOCOL_ERROR),
      Frame::window_update(0, 1024),
    ];

    // back to back in one buffer
    let mut buf = vec![];
    for frame in frames.iter() {
      buf.extend(frame.encode());
    }

    let mut pos = 0;
    for frame in frames.iter() {
      let (decoded, used) = Frame::decode(&buf[pos..]).unwrap();
      assert_eq!(&decoded, frame);
      pos += used;
    }
    assert_eq!(pos, buf.len());
  }

  #[test]
  fn test_frame_malformed() {
    let valid = Frame::ping(1, false).encode();

    let mut buf = valid.clone();
    buf[0] = 2;
    assert!(matches!(
      Frame::decode(&buf),
      Err(TokioSpdyError::MalformedFrame { .. })
    ));

    let mut buf = valid.clone();
    buf[1] = 42;
    assert!(matches!(
      Frame::decode(&buf),
      Err(TokioSpdyError::MalformedFrame { .. })
    ));

    // FIN on a ping
    let mut buf = valid.clone();
    buf[2] = flags::FIN;
    assert!(Frame::decode(&buf).is_err());

    // ping with a stream id
    let mut buf = valid.clone();
    buf[11] = 1;
    assert!(Frame::decode(&buf).is_err());

    // impossible length is rejected from the header alone
    let mut buf = Frame::data(1, vec![], false).encode();
    BigEndian::write_u32(&mut buf[4..8], MAX_FRAME_LENGTH + 1);
    assert!(matches!(
      Frame::decode(&buf),
      Err(TokioSpdyError::MalformedFrame { .. })
    ));

    // data on stream 0
    let buf = Frame::data(0, vec![1], false).encode();
    assert!(Frame::decode(&buf).is_err());

    // zero window delta
    let buf = Frame::window_update(1, 0).encode();
    assert!(Frame::decode(&buf).is_err());

    // settings ack with payload
    let mut frame = Frame::settings(vec![Setting { id: 1, value: 1 }]);
    frame.flags = flags::ACK;
    assert!(Frame::decode(&frame.encode()).is_err());
  }

  #[test]
  fn test_cmd_values() {
    for raw in 0u8..8 {
      let cmd = Cmd::try_from(raw).unwrap();
      let back: u8 = cmd.into();
      assert_eq!(back, raw);
    }
    assert!(Cmd::try_from(8).is_err());
  }
}
