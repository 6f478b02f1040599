use crate::error::{Result, TokioSpdyError};
use byteorder::{BigEndian, ByteOrder};

/// Ordered header list sent with SYN_STREAM and SYN_REPLY frames.
///
/// Insertion order and duplicate names are preserved on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self(vec![])
  }

  /// Append a header, keeping any previous value with the same name.
  pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  /// First value of `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }

  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .0
      .iter()
      .filter(move |(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  // u32 count, then u32 length-prefixed name and value for each entry.
  pub(crate) fn encoded_len(&self) -> usize {
    4 + self
      .0
      .iter()
      .map(|(k, v)| 8 + k.len() + v.len())
      .sum::<usize>()
  }

  pub(crate) fn encode_into(&self, buf: &mut [u8]) {
    BigEndian::write_u32(&mut buf[0..4], self.0.len() as u32);
    let mut pos = 4;
    for (k, v) in self.0.iter() {
      for part in [k.as_bytes(), v.as_bytes()] {
        BigEndian::write_u32(&mut buf[pos..pos + 4], part.len() as u32);
        pos += 4;
        buf[pos..pos + part.len()].copy_from_slice(part);
        pos += part.len();
      }
    }
  }

  pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
    let mut reader = BlockReader { buf, pos: 0 };
    let count = reader.u32()? as usize;
    // Every entry takes at least 8 bytes, reject absurd counts before allocating.
    if count > buf.len() / 8 {
      return Err(malformed("header count exceeds block size"));
    }

    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
      let name = reader.string()?;
      let value = reader.string()?;
      headers.push((name, value));
    }

    if reader.pos != buf.len() {
      return Err(malformed("trailing bytes after header block"));
    }

    Ok(Self(headers))
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

struct BlockReader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> BlockReader<'a> {
  fn take(&mut self, n: usize) -> Result<&'a [u8]> {
    if self.buf.len() - self.pos < n {
      return Err(malformed("header block shorter than declared"));
    }
    let part = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(part)
  }

  fn u32(&mut self) -> Result<u32> {
    Ok(BigEndian::read_u32(self.take(4)?))
  }

  fn string(&mut self) -> Result<String> {
    let len = self.u32()? as usize;
    let raw = self.take(len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("header is not utf-8"))
  }
}

fn malformed(msg: &str) -> TokioSpdyError {
  TokioSpdyError::MalformedFrame {
    msg: msg.to_string(),
  }
}

#[cfg(test)]
mod test {
  use super::Headers;

  #[test]
  fn test_headers_order_and_duplicates() {
    let mut headers = Headers::new();
    headers.add(":method", "POST");
    headers.add(":path", "/");
    headers.add("accept", "a");
    headers.add("accept", "b");

    assert_eq!(headers.get(":method"), Some("POST"));
    assert_eq!(headers.get("missing"), None);
    assert_eq!(headers.get_all("accept").collect::<Vec<_>>(), vec!["a", "b"]);
    let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec![":method", ":path", "accept", "accept"]);

    let mut buf = vec![0; headers.encoded_len()];
    headers.encode_into(&mut buf);
    assert_eq!(Headers::decode(&buf).unwrap(), headers);
  }

  #[test]
  fn test_headers_decode_errors() {
    // count says one entry but nothing follows
    assert!(Headers::decode(&[0, 0, 0, 1]).is_err());
    // name length points past the block
    assert!(Headers::decode(&[0, 0, 0, 1, 0, 0, 0, 9, b'a', 0, 0, 0, 0]).is_err());
    // invalid utf-8
    assert!(Headers::decode(&[0, 0, 0, 1, 0, 0, 0, 1, 0xff, 0, 0, 0, 0]).is_err());
    // trailing bytes
    assert!(Headers::decode(&[0, 0, 0, 0, 1]).is_err());
    // too short for a count
    assert!(Headers::decode(&[0, 0]).is_err());

    let empty = Headers::decode(&[0, 0, 0, 0]).unwrap();
    assert!(empty.is_empty());
  }
}
