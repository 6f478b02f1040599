use tokio::net::TcpListener;
use tokio_spdystream::{Headers, Session, SpdyConfig};

// Echo every stream back to the client.
#[tokio::main]
async fn main() {
  let listener = TcpListener::bind("0.0.0.0:3100").await.unwrap();
  loop {
    let (client, _) = listener.accept().await.unwrap();
    let session = Session::server(client, SpdyConfig::default()).unwrap();

    tokio::spawn(async move {
      loop {
        let mut stream = match session.accept_stream().await {
          Ok(stream) => stream,
          Err(err) => {
            println!("[server] session ended: {}", err);
            return;
          }
        };
        println!(
          "[server] accept stream {}, path {:?}",
          stream.sid(),
          stream.headers().get(":path")
        );

        tokio::spawn(async move {
          stream.reply(Headers::new(), false).await.unwrap();

          let mut buf = vec![0; 4096];
          loop {
            let n = match stream.read(&mut buf).await {
              Ok(n) => n,
              Err(err) => {
                println!("[server] stream {} failed: {}", stream.sid(), err);
                return;
              }
            };
            if n == 0 {
              println!("[server] stream fin {}", stream.sid());
              let _ = stream.close().await;
              return;
            }
            if stream.write_all(&buf[..n]).await.is_err() {
              return;
            }
          }
        });
      }
    });
  }
}
