use tokio::net::TcpStream;
use tokio_spdystream::{Headers, Session, SpdyConfig};

#[tokio::main]
async fn main() {
  let client = TcpStream::connect("127.0.0.1:3100").await.unwrap();

  let session = Session::client(client, SpdyConfig::default()).unwrap();

  let headers: Headers = [(":method", "POST"), (":path", "/")].into_iter().collect();
  let mut stream = session.create_stream(headers, false).await.unwrap();
  stream.wait().await.unwrap();

  stream.write_all(b"Writing to stream").await.unwrap();

  let mut buf = vec![0; 25];
  let n = stream.read(&mut buf).await.unwrap();
  if n == 0 {
    println!("stream fin");
    return;
  }
  println!("receive {:?}", String::from_utf8_lossy(&buf[..n]));

  stream.close().await.unwrap();
  session.close().await;
}
