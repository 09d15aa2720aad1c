//! Run a QoS listener over real loopback TCP connections.

// @@ begin test lint list maintained by maint/add_warning @@
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::clone_on_copy)]
#![allow(clippy::dbg_macro)]
#![allow(clippy::mixed_attributes_style)]
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
#![allow(clippy::single_char_pattern)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::unchecked_duration_subtraction)]
#![allow(clippy::useless_vec)]
#![allow(clippy::needless_pass_by_value)]
//! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};
use qos_listener::{QosConfig, QosListener};
use qos_rtcompat::tokio::{TcpListener, TcpStream, TokioRuntimeHandle};

const KIB: u64 = 1 << 10;

/// Bind a QoS listener to an ephemeral loopback port.
async fn bind(config: &QosConfig) -> QosListener<TokioRuntimeHandle, TcpListener> {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let tcp = TcpListener::bind(&addr).await.unwrap();
    let rt = TokioRuntimeHandle::current().unwrap();
    QosListener::with_config(rt, tcp, config).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_writes_are_throttled() {
    let mut cfg = QosConfig::builder();
    cfg.limit_per_conn(64 * KIB);
    let lis = bind(&cfg.build().unwrap()).await;
    let addr = lis.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut s = TcpStream::connect(&addr).await.unwrap();
        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        got
    });

    let (mut stream, _) = lis.accept().await.unwrap();
    let data = vec![0xa5_u8; (256 * KIB) as usize];
    let start = Instant::now();
    stream.write_all(&data).await.unwrap();
    stream.close().await.unwrap();
    let elapsed = start.elapsed();

    // Four chunks of 64 KiB, the first of them postponed by a second.
    assert!(elapsed >= Duration::from_millis(3500), "{elapsed:?}");
    let got = client.await.unwrap();
    assert_eq!(got.len(), data.len());
    assert!(got == data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_limit_is_shared() {
    let mut cfg = QosConfig::builder();
    cfg.limit_per_conn(200 * KIB).limit_global(100 * KIB);
    let lis = bind(&cfg.build().unwrap()).await;
    let addr = lis.local_addr().unwrap();

    let c1 = TcpStream::connect(&addr).await.unwrap();
    let (mut s1, _) = lis.accept().await.unwrap();
    assert_eq!(s1.limit(), 100 * KIB);

    let c2 = TcpStream::connect(&addr).await.unwrap();
    let (s2, _) = lis.accept().await.unwrap();
    assert_eq!(s2.limit(), 50 * KIB);

    // The first stream learns about its new share in the background.
    let deadline = Instant::now() + Duration::from_secs(5);
    while s1.limit() != 50 * KIB {
        assert!(Instant::now() < deadline, "limit was never updated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // When one closes, the other gets the whole global limit back.
    s1.close().await.unwrap();
    drop(c1);
    let deadline = Instant::now() + Duration::from_secs(5);
    while s2.limit() != 100 * KIB {
        assert!(Instant::now() < deadline, "limit was never updated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(lis.status().active, 1);
    drop(c2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlimited_is_fast() {
    let lis = bind(&QosConfig::default()).await;
    let addr = lis.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut s = TcpStream::connect(&addr).await.unwrap();
        s.write_all(&[1; 1 << 20]).await.unwrap();
        s.close().await.unwrap();
    });

    let (mut stream, _) = lis.accept().await.unwrap();
    let start = Instant::now();
    let mut got = Vec::new();
    stream.read_to_end(&mut got).await.unwrap();
    client.await.unwrap();
    assert_eq!(got.len(), 1 << 20);
    assert!(start.elapsed() < Duration::from_secs(5));
}
