use std::time::Duration;

use braid_mux::{MuxError, Session, SessionConfig, Stream};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// Read exactly `want` bytes from the stream, across partial reads.
async fn read_full(stream: &Stream, want: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(want);
    let mut buf = [0u8; 4096];
    while collected.len() < want {
        let n = stream.read(&mut buf).await.expect("read failed");
        assert!(n > 0, "unexpected EOF after {} bytes", collected.len());
        collected.extend_from_slice(&buf[..n]);
    }
    collected
}

/// Read raw transport bytes until `expected` shows up as a contiguous
/// window, or panic on timeout.
async fn expect_on_wire(raw: &mut tokio::io::DuplexStream, expected: &[u8]) {
    timeout(Duration::from_secs(5), async {
        let mut collected = Vec::new();
        loop {
            let mut buf = [0u8; 256];
            let n = raw.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
            if collected.windows(expected.len()).any(|w| w == expected) {
                return;
            }
        }
    })
    .await
    .expect("expected frame never appeared on the wire");
}

#[tokio::test]
async fn echo_roundtrip() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, SessionConfig::default()).unwrap();
    let mut server = Session::server(b, SessionConfig::default()).unwrap();

    let stream = client.open_stream().await.unwrap();
    assert_eq!(stream.sid().id(), 1);
    stream.write(b"hi").await.unwrap();

    let accepted = timeout(Duration::from_secs(5), server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.sid().id(), 1);
    assert_eq!(read_full(&accepted, 2).await, b"hi");

    accepted.write(b"ho").await.unwrap();
    assert_eq!(read_full(&stream, 2).await, b"ho");

    assert_eq!(client.num_streams(), 1);
    assert_eq!(server.num_streams(), 1);
}

#[tokio::test]
async fn psh_frame_wire_format() {
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let config = SessionConfig {
        test: true,
        ..Default::default()
    };
    let client = Session::client(a, config).unwrap();

    let stream = client.open_stream().await.unwrap();
    stream.write(b"hi").await.unwrap();

    // ver=1, PSH, length=2 LE, sid=1 LE, payload
    let expected = [1u8, 2, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, b'h', b'i'];
    expect_on_wire(&mut raw, &expected).await;
}

#[tokio::test]
async fn custom_command_reaches_the_wire() {
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let config = SessionConfig {
        test: true,
        ..Default::default()
    };
    let client = Session::client(a, config).unwrap();

    let n = client
        .write_custom_cmd(0x42, Bytes::from_static(b"ext"))
        .await
        .unwrap();
    assert_eq!(n, 3);

    // Custom commands go out with the reserved control sid.
    let expected = [1u8, 0x42, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, b'e', b'x', b't'];
    expect_on_wire(&mut raw, &expected).await;
}

#[tokio::test]
async fn flow_control_pause_and_resume() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, SessionConfig::default()).unwrap();
    let server_config = SessionConfig {
        max_receive_buffer: 10,
        ..Default::default()
    };
    let mut server = Session::server(b, server_config).unwrap();

    let stream = client.open_stream().await.unwrap();
    // Exactly drains the server bucket to 0; its receive loop pauses.
    stream.write(&[7u8; 10]).await.unwrap();

    let accepted = timeout(Duration::from_secs(5), server.accept_stream())
        .await
        .unwrap()
        .unwrap();

    // Waits in the transport until the consumer frees credit.
    stream.write(b"more").await.unwrap();

    let mut first = [0u8; 4];
    let n = accepted.read(&mut first).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(first, [7u8; 4]);

    // Returning those 4 tokens resumes the receive loop; everything
    // else flows through.
    let rest = read_full(&accepted, 10).await;
    assert_eq!(&rest[..6], &[7u8; 6]);
    assert_eq!(&rest[6..], b"more");
}

#[tokio::test(start_paused = true)]
async fn keepalive_timeout_closes_session() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let config = SessionConfig {
        keep_alive_interval: Duration::from_secs(1),
        keep_alive_timeout: Duration::from_secs(3),
        ..Default::default()
    };
    let mut session = Session::client(a, config).unwrap();
    // The peer never speaks.
    let _mute_peer = b;

    let err = session.accept_stream().await.unwrap_err();
    assert!(matches!(err, MuxError::BrokenPipe));
    assert!(session.is_closed());
    assert_eq!(session.num_streams(), 0);
    assert!(matches!(session.close(), Err(MuxError::BrokenPipe)));
}

#[tokio::test]
async fn version_mismatch_is_fatal() {
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let mut client = Session::client(a, SessionConfig::default()).unwrap();
    let stream = client.open_stream().await.unwrap();

    raw.write_all(&[0xFF, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

    let err = timeout(Duration::from_secs(5), client.accept_stream())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MuxError::BrokenPipe));
    assert!(client.is_closed());
    assert!(stream.is_reset());

    let mut buf = [0u8; 8];
    assert!(matches!(
        stream.read(&mut buf).await,
        Err(MuxError::BrokenPipe)
    ));
    assert!(matches!(stream.write(b"x").await, Err(MuxError::BrokenPipe)));
}

#[tokio::test]
async fn close_is_single_shot() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, SessionConfig::default()).unwrap();
    let _server = Session::server(b, SessionConfig::default()).unwrap();
    let stream = client.open_stream().await.unwrap();

    client.close().unwrap();
    assert!(client.is_closed());
    assert!(matches!(client.close(), Err(MuxError::BrokenPipe)));
    assert_eq!(client.num_streams(), 0);
    assert!(stream.is_reset());
    assert!(matches!(
        client.open_stream().await,
        Err(MuxError::BrokenPipe)
    ));
}

#[tokio::test]
async fn fin_drains_buffered_data_then_eof() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, SessionConfig::default()).unwrap();
    let mut server = Session::server(b, SessionConfig::default()).unwrap();

    let stream = client.open_stream().await.unwrap();
    stream.write(b"bye").await.unwrap();
    stream.close().await.unwrap();
    assert_eq!(client.num_streams(), 0);
    assert!(matches!(stream.close().await, Err(MuxError::BrokenPipe)));

    let accepted = timeout(Duration::from_secs(5), server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    // Buffered data survives the reset; EOF comes after.
    assert_eq!(read_full(&accepted, 3).await, b"bye");
    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf).await.unwrap(), 0);
    assert!(accepted.is_reset());
}

#[tokio::test]
async fn large_write_is_chunked_and_delivered_in_order() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, SessionConfig::default()).unwrap();
    let mut server = Session::server(b, SessionConfig::default()).unwrap();

    let payload: Vec<u8> = (0..100_000usize).map(|i| (i % 251) as u8).collect();

    let stream = client.open_stream().await.unwrap();
    let written = stream.write(&payload).await.unwrap();
    assert_eq!(written, payload.len());

    let accepted = timeout(Duration::from_secs(5), server.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let received = read_full(&accepted, payload.len()).await;
    assert_eq!(received, payload);
}
