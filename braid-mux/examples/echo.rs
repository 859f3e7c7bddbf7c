use anyhow::Result;
use braid_mux::{Session, SessionConfig};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // Two sessions over an in-memory pipe. In production the transport
    // is a TcpStream or anything else AsyncRead + AsyncWrite.
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, SessionConfig::default())?;
    let mut server = Session::server(b, SessionConfig::default())?;

    let echo = tokio::spawn(async move {
        let stream = server.accept_stream().await?;
        tracing::info!("accepted stream {}", stream.sid());
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write(&buf[..n]).await?;
        }
        anyhow::Ok(())
    });

    let stream = client.open_stream().await?;
    tracing::info!("opened stream {}", stream.sid());

    stream.write(b"hello, braid!").await?;
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    tracing::info!("echoed back: {}", String::from_utf8_lossy(&buf[..n]));

    if let Some(rtt) = client.rtt() {
        tracing::info!("round-trip sample: {:?}", rtt);
    }

    stream.close().await?;
    echo.await??;
    // The server side is gone by now; the session may already have
    // observed the EOF and torn itself down.
    let _ = client.close();

    Ok(())
}
