use futures::future::join_all;
use spark_transport_srt::{
    CallContext, Cancellation, MemoryEngine, MemoryEngineConfig, SrtAddr, SrtError, SrtTransport,
};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

fn transport() -> (MemoryEngine, SrtTransport) {
    let engine = MemoryEngine::new();
    (engine.clone(), SrtTransport::new(engine))
}

#[tokio::test]
async fn listener_reports_bound_address() {
    let (_, srt) = transport();
    let cases = [
        ("srt", "127.0.0.1:0", Some(IpAddr::V4(Ipv4Addr::LOCALHOST))),
        ("srt4", "127.0.0.1:0", Some(IpAddr::V4(Ipv4Addr::LOCALHOST))),
        ("srt6", "[::1]:0", Some(IpAddr::V6(Ipv6Addr::LOCALHOST))),
        ("srt", ":0", None),
    ];
    for (network, address, ip) in cases {
        let ln = srt.listen(network, address).await.expect(address);
        let bound = ln.addr();
        assert_eq!(bound.network(), "srt");
        assert_eq!(bound.ip(), ip, "{network} {address}");
        assert_ne!(bound.port(), 0, "ephemeral port is read back");
        ln.close().expect("close");
    }
}

#[tokio::test]
async fn listen_forwards_context_options_to_engine() {
    let (_, srt) = transport();
    let ctx = CallContext::new().with_options(spark_transport_srt::Options::new().set("payloadsize", "32"));
    let ln = srt
        .listen_context(&ctx, "srt6", "[::1%lo0]:0")
        .await
        .expect("listen with zone and options");
    assert_eq!(ln.addr().zone(), Some("lo0"));

    let bad = CallContext::new().with_options(spark_transport_srt::Options::new().set("payloadsize", "big"));
    let err = srt
        .listen_context(&bad, "srt", "127.0.0.1:0")
        .await
        .expect_err("engine rejects option");
    assert_eq!(err.io_kind(), Some(std::io::ErrorKind::InvalidInput));
    assert!(err.to_string().contains("invalid value \"big\" for option payloadsize"));
}

#[tokio::test]
async fn listen_addr_checks_family_and_accepts_nil() {
    let (_, srt) = transport();
    let ctx = CallContext::new();
    let ln = srt.listen_addr(&ctx, "srt", None).await.expect("nil address");
    assert!(ln.addr().is_unspecified());
    assert_ne!(ln.addr().port(), 0);

    let v6 = SrtAddr::from((Ipv6Addr::LOCALHOST, 0));
    let err = srt
        .listen_addr(&ctx, "srt4", Some(&v6))
        .await
        .expect_err("family mismatch");
    assert!(matches!(err, SrtError::NoSuitableAddress { .. }));

    let err = srt
        .listen_addr(&ctx, "quic", None)
        .await
        .expect_err("unknown network");
    assert!(matches!(err, SrtError::UnknownNetwork(_)));
}

#[tokio::test]
async fn port_in_use_surfaces_engine_error() {
    let (_, srt) = transport();
    let first = srt.listen("srt", "127.0.0.1:0").await.expect("first");
    let err = srt
        .listen("srt", &first.addr().to_string())
        .await
        .expect_err("port taken");
    assert_eq!(err.io_kind(), Some(std::io::ErrorKind::AddrInUse));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accept_delivers_each_connection_once() {
    const ACCEPTORS: usize = 10;
    const DIALS: usize = 100;

    let (_, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    let accepted = Arc::new(AtomicUsize::new(0));

    let acceptors: Vec<_> = (0..ACCEPTORS)
        .map(|_| {
            let ln = ln.clone();
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                let mut remotes = Vec::new();
                loop {
                    match ln.accept().await {
                        Ok(conn) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                            remotes.push(conn.remote_addr().clone());
                        }
                        Err(err) => {
                            assert!(err.is_closed(), "unexpected accept error: {err}");
                            return remotes;
                        }
                    }
                }
            })
        })
        .collect();

    let dialer = srt.dialer().with_timeout(Duration::from_millis(200));
    let target = ln.addr().to_string();
    let dials = join_all((0..DIALS).map(|_| {
        let dialer = dialer.clone();
        let target = target.clone();
        async move { dialer.dial("srt", &target).await }
    }))
    .await;
    let established: Vec<_> = dials.into_iter().filter_map(Result::ok).collect();
    assert!(DIALS - established.len() <= DIALS / 9, "too many failed dials");

    timeout(Duration::from_secs(5), async {
        while accepted.load(Ordering::SeqCst) < established.len() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("all established connections accepted");
    ln.close().expect("close");

    let mut seen = HashSet::new();
    for acceptor in acceptors {
        for remote in acceptor.await.expect("join") {
            assert!(seen.insert(remote), "connection delivered twice");
        }
    }
    assert_eq!(seen.len(), established.len());
    for conn in &established {
        assert!(seen.contains(conn.local_addr()));
    }
}

#[tokio::test]
async fn close_unblocks_every_blocked_acceptor() {
    const BLOCKED: usize = 8;
    let (_, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");

    let waiters: Vec<_> = (0..BLOCKED)
        .map(|_| {
            let ln = ln.clone();
            tokio::spawn(async move { ln.accept().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    ln.close().expect("first close");
    let results = timeout(Duration::from_secs(1), join_all(waiters))
        .await
        .expect("acceptors unblocked promptly");
    for result in results {
        let err = result.expect("join").expect_err("closed");
        assert!(err.is_closed());
    }

    let err = ln.accept().await.expect_err("accept after close");
    assert!(err.is_closed());
}

#[tokio::test]
async fn close_is_idempotent_and_never_blocks() {
    let (engine, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    assert_eq!(engine.ports_in_use(), 1);
    ln.close().expect("first close");
    assert_eq!(engine.ports_in_use(), 0);
    for _ in 0..3 {
        let err = ln.close().expect_err("repeated close");
        assert!(err.is_closed());
    }
}

#[tokio::test]
async fn dropping_last_clone_releases_the_port() {
    let (engine, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    let clone = ln.clone();
    drop(ln);
    assert_eq!(engine.ports_in_use(), 1);
    drop(clone);
    assert_eq!(engine.ports_in_use(), 0);
}

#[tokio::test]
async fn handshake_failures_do_not_terminate_listener() {
    let (engine, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    engine.fail_next_handshakes(3);

    let target = ln.addr().to_string();
    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(srt.dial("srt", &target).await.expect("dial"));
    }

    let conn = timeout(Duration::from_secs(1), ln.accept())
        .await
        .expect("accept returns")
        .expect("fourth handshake succeeds");
    assert_eq!(conn.remote_addr(), clients[3].local_addr());

    // 被放弃的握手对客户端表现为对端关闭。
    let mut buf = [0u8; 1];
    let read = clients[0].read(&mut buf).await;
    assert!(matches!(read, Ok(0)), "abandoned client sees end of stream");
}

#[tokio::test]
async fn unrecoverable_engine_failure_reaches_every_caller() {
    let (engine, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let ln = ln.clone();
            tokio::spawn(async move { ln.accept().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.shutdown();

    let results = timeout(Duration::from_secs(1), join_all(waiters))
        .await
        .expect("failure unblocks acceptors");
    for result in results {
        let err = result.expect("join").expect_err("engine failure");
        assert!(matches!(err, SrtError::Io { .. }));
        assert!(!err.is_closed());
        assert!(err.to_string().contains("memory engine shut down"));
    }
    let err = ln.accept().await.expect_err("later accept");
    assert!(err.to_string().contains("memory engine shut down"));
}

#[tokio::test]
async fn accept_context_honours_cancellation_and_deadline() {
    let (_, srt) = transport();
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");

    let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
    let err = ln.accept_context(&ctx).await.expect_err("deadline");
    assert!(err.is_timeout());

    let cancellation = Cancellation::new();
    let ctx = CallContext::new().with_cancellation(cancellation.clone());
    let pending = tokio::spawn({
        let ln = ln.clone();
        async move { ln.accept_context(&ctx).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancellation.cancel();
    let err = timeout(Duration::from_secs(1), pending)
        .await
        .expect("cancel observed")
        .expect("join")
        .expect_err("cancelled");
    assert!(err.is_cancelled());

    // 取消不会吞掉随后到达的连接。
    let client = srt.dial("srt", &ln.addr().to_string()).await.expect("dial");
    let conn = ln.accept().await.expect("accept after cancel");
    assert_eq!(conn.remote_addr(), client.local_addr());
}

#[tokio::test]
async fn backlog_bounds_pending_handshakes() {
    let engine = MemoryEngine::with_config(MemoryEngineConfig::default().with_backlog(1));
    let srt = SrtTransport::new(engine);
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    let target = ln.addr().to_string();

    let _first = srt.dial("srt", &target).await.expect("fills backlog");
    let err = srt
        .dialer()
        .with_timeout(Duration::from_millis(30))
        .dial("srt", &target)
        .await
        .expect_err("backlog full");
    assert!(err.is_timeout());

    ln.accept().await.expect("drain backlog");
    srt.dial("srt", &target).await.expect("space again");
}

#[tokio::test]
async fn close_refuses_dials_waiting_for_backlog_space() {
    let engine = MemoryEngine::with_config(MemoryEngineConfig::default().with_backlog(1));
    let srt = SrtTransport::new(engine.clone());
    let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
    let target = ln.addr().to_string();

    let queued = srt.dial("srt", &target).await.expect("fills backlog");
    let waiting = {
        let srt = srt.clone();
        let target = target.clone();
        tokio::spawn(async move { srt.dial("srt", &target).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished(), "dial waits for backlog space");

    let _keep_alive = ln.clone();
    ln.close().expect("close");
    let err = timeout(Duration::from_secs(1), waiting)
        .await
        .expect("pending dial released by close")
        .expect("join")
        .expect_err("refused");
    assert_eq!(err.io_kind(), Some(std::io::ErrorKind::ConnectionRefused));

    let mut buf = [0u8; 1];
    assert_eq!(queued.read(&mut buf).await.expect("undelivered connection ends"), 0);
    queued.close().expect("close queued");
    assert_eq!(engine.ports_in_use(), 0);
}
