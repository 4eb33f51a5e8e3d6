//! Loopback TCP Integration Tests
//!
//! A real listener on 127.0.0.1 receives a fragmented, rotated stream.

mod integration_harness;

use std::sync::Arc;
use std::time::Duration;

use integration_harness::init_tracing;
use shroud_transport::{
    Dialer, EvasionConfig, EvasionStream, FragmentConfig, MultiplexConfig, TcpDialer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Accept connections and hand each one's full contents over, in accept order
async fn collecting_server() -> (String, mpsc::UnboundedReceiver<(usize, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            let id = index;
            index += 1;
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = socket.read_to_end(&mut received).await;
                let _ = tx.send((id, received));
            });
        }
    });

    (addr, rx)
}

#[tokio::test]
async fn test_fragmented_rotated_stream_over_tcp() {
    init_tracing();
    let (addr, mut rx) = collecting_server().await;

    let config = EvasionConfig {
        fragment: FragmentConfig::fixed(10_240),
        multiplex: MultiplexConfig::with_limit(30_000),
        ..Default::default()
    };
    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(addr.clone()));
    let stream = EvasionStream::connect(dialer, config).await.unwrap();
    assert_eq!(
        stream.remote_addr().map(|a| a.to_string()).as_deref(),
        Some(addr.as_str())
    );

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8 + 1).collect();
    for chunk in data.chunks(25_000) {
        stream.write_payload(chunk).await.unwrap();
    }
    let stats = stream.stats().await;
    stream.close().await;

    // 28,500 bytes per connection
    assert_eq!(stats.pool.dials, 4);

    let mut pieces = Vec::new();
    while pieces.len() < 4 {
        let piece = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        pieces.push(piece);
    }
    pieces.sort_by_key(|(id, _)| *id);

    for (_, bytes) in &pieces {
        assert!(bytes.len() <= 28_500);
    }
    let joined: Vec<u8> = pieces.into_iter().flat_map(|(_, bytes)| bytes).collect();
    assert_eq!(joined, data);
}

#[tokio::test]
async fn test_echo_over_tcp() -> anyhow::Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 4096];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(addr.to_string()));
    let mut stream = EvasionStream::connect(dialer, EvasionConfig::default()).await?;
    assert!(stream.local_addr().is_some());

    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    stream.write_all(request).await?;
    let mut echoed = vec![0u8; request.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed)).await??;
    assert_eq!(&echoed[..], request);

    stream.shutdown().await?;
    assert!(stream.is_closed());
    Ok(())
}
