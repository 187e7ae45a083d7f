//! Conn engine integration tests over in-memory streams.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use carrier_core::{
    Conn, ConnConfig, ConnError, ConnState, Context, Handler, HandlerError, NoopHandler, Pools,
    Role, SequenceConfig, handler_fn,
};
use carrier_crypto::{Security, establish};
use carrier_proto::{ProtocolError, RecordConfig, RecordWrite, split_plain};
use tokio::sync::mpsc;

fn echo() -> Arc<dyn Handler> {
    Arc::new(handler_fn(|ctx: &mut Context| {
        ctx.reply(ctx.body())?;
        Ok(())
    }))
}

fn pair(client: Arc<dyn Handler>, server: Arc<dyn Handler>, pools: &Arc<Pools>) -> (Conn, Conn) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let record = RecordConfig::default();
    let (a_read, a_write) = split_plain(a, &record);
    let (b_read, b_write) = split_plain(b, &record);

    let client = Conn::builder(Role::Initiator)
        .handler(client)
        .pools(Arc::clone(pools))
        .spawn(a_read, a_write)
        .unwrap();
    let server = Conn::builder(Role::Acceptor)
        .handler(server)
        .pools(Arc::clone(pools))
        .spawn(b_read, b_write)
        .unwrap();
    (client, server)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held: {what}");
}

/// Replies after a delay.
struct SlowEcho(Duration);

#[async_trait]
impl Handler for SlowEcho {
    async fn handle_message(&self, ctx: &mut Context) -> Result<(), HandlerError> {
        tokio::time::sleep(self.0).await;
        ctx.reply(ctx.body())?;
        Ok(())
    }
}

/// Accepts records until the `fail_at`th, then fails every write.
struct FailingWriter {
    attempts: Arc<AtomicUsize>,
    fail_at: usize,
}

#[async_trait]
impl RecordWrite for FailingWriter {
    async fn write_record(&mut self, _record: &[u8]) -> carrier_proto::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt >= self.fail_at {
            return Err(ProtocolError::Io(io::Error::other("boom")));
        }
        Ok(())
    }

    async fn flush(&mut self) -> carrier_proto::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> carrier_proto::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn request_returns_the_reply() {
    let pools = Arc::new(Pools::new());
    let server = handler_fn(|ctx: &mut Context| {
        if ctx.body() == b"ping" {
            ctx.reply(b"pong")?;
            Ok(())
        } else {
            Err(HandlerError::Malformed(format!("{:?}", ctx.body())))
        }
    });
    let (client, _server) = pair(Arc::new(NoopHandler), Arc::new(server), &pools);

    let mut dst = b"leftover".to_vec();
    client.request(&mut dst, b"ping").await.unwrap();
    assert_eq!(dst, b"pong");
}

#[tokio::test]
async fn send_reaches_the_handler() {
    let pools = Arc::new(Pools::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = handler_fn(move |ctx: &mut Context| {
        let _ = tx.send((ctx.seq(), ctx.body().to_vec()));
        Ok(())
    });
    let (client, _server) = pair(Arc::new(NoopHandler), Arc::new(server), &pools);

    client.send(b"hello").await.unwrap();
    client.send_no_wait(b"again").unwrap();

    assert_eq!(rx.recv().await.unwrap(), (0, b"hello".to_vec()));
    assert_eq!(rx.recv().await.unwrap(), (0, b"again".to_vec()));
}

#[tokio::test]
async fn concurrent_requests_use_distinct_sequences() {
    let pools = Arc::new(Pools::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = handler_fn(move |ctx: &mut Context| {
        let _ = tx.send(ctx.seq());
        ctx.reply(ctx.body())?;
        Ok(())
    });
    let (client, _server) = pair(Arc::new(NoopHandler), Arc::new(server), &pools);

    let mut tasks = Vec::new();
    for i in 0..32u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut dst = Vec::new();
            client.request(&mut dst, &i.to_be_bytes()).await.unwrap();
            assert_eq!(dst, i.to_be_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut seqs = Vec::new();
    while let Ok(seq) = rx.try_recv() {
        seqs.push(seq);
    }
    seqs.sort_unstable();
    let expected: Vec<u32> = (0..32).map(|i| 1 + 2 * i).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn full_duplex_requests_never_cross() {
    let pools = Arc::new(Pools::new());
    let (client, server) = pair(echo(), echo(), &pools);

    let mut tasks = Vec::new();
    for i in 0..50u32 {
        for (side, conn) in [(0u8, &client), (1u8, &server)] {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let payload = [&[side][..], &i.to_be_bytes()].concat();
                let mut dst = Vec::new();
                conn.request(&mut dst, &payload).await.unwrap();
                assert_eq!(dst, payload);
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn close_fails_every_pending_request() {
    let pools = Arc::new(Pools::new());
    let (client, server) = pair(Arc::new(NoopHandler), Arc::new(NoopHandler), &pools);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut dst = Vec::new();
            client.request_with_timeout(&mut dst, b"never answered", Duration::from_secs(60)).await
        }));
    }
    eventually("all requests pending", || client.pending_requests() == 8).await;

    client.close();
    client.close();
    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(ConnError::Closed)));
    }

    tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(client.pending_requests(), 0);

    // The peer sees EOF and shuts down on its own.
    tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
    assert_eq!(server.state(), ConnState::Closed);
}

#[tokio::test]
async fn calls_after_close_are_rejected() {
    let pools = Arc::new(Pools::new());
    let (client, _server) = pair(Arc::new(NoopHandler), echo(), &pools);
    client.close();

    let mut dst = Vec::new();
    assert!(matches!(client.send(b"x").await, Err(ConnError::Closed)));
    assert!(matches!(client.send_no_wait(b"x"), Err(ConnError::Closed)));
    assert!(matches!(client.request(&mut dst, b"x").await, Err(ConnError::Closed)));
    assert_ne!(client.state(), ConnState::Open);
}

#[tokio::test]
async fn timeout_leaves_the_connection_open() {
    let pools = Arc::new(Pools::new());
    let (client, _server) = pair(Arc::new(NoopHandler), Arc::new(NoopHandler), &pools);

    let mut dst = b"untouched".to_vec();
    let err = client
        .request_with_timeout(&mut dst, b"hello?", Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnError::Timeout(d) if d == Duration::from_millis(20)));
    assert_eq!(dst, b"untouched");
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_open());
}

#[tokio::test]
async fn late_replies_are_dropped() {
    let pools = Arc::new(Pools::new());
    let slow = Arc::new(SlowEcho(Duration::from_millis(100)));
    let (client, _server) = pair(Arc::new(NoopHandler), slow, &pools);

    let mut dst = Vec::new();
    let err = client
        .request_with_timeout(&mut dst, b"first", Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnError::Timeout(_)));

    tokio::time::sleep(Duration::from_millis(150)).await;
    client.request_with_timeout(&mut dst, b"second", Duration::from_secs(2)).await.unwrap();
    assert_eq!(dst, b"second");
}

#[tokio::test]
async fn handler_errors_are_not_fatal() {
    let pools = Arc::new(Pools::new());
    let server = handler_fn(|ctx: &mut Context| {
        if ctx.body() == b"bad" {
            return Err(HandlerError::Other("rejected".into()));
        }
        ctx.reply(ctx.body())?;
        Ok(())
    });
    let (client, _server) = pair(Arc::new(NoopHandler), Arc::new(server), &pools);

    client.send(b"bad").await.unwrap();
    let mut dst = Vec::new();
    client.request(&mut dst, b"good").await.unwrap();
    assert_eq!(dst, b"good");
}

#[tokio::test]
async fn peer_hangup_closes_the_connection() {
    let pools = Arc::new(Pools::new());
    let (client, server) = pair(Arc::new(NoopHandler), Arc::new(NoopHandler), &pools);

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut dst = Vec::new();
            client.request_with_timeout(&mut dst, b"anyone?", Duration::from_secs(60)).await
        })
    };
    eventually("request pending", || client.pending_requests() == 1).await;

    server.close();
    assert!(matches!(waiter.await.unwrap(), Err(ConnError::Closed)));
    tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
}

#[tokio::test]
async fn pools_balance_after_traffic() {
    let pools = Arc::new(Pools::new());
    let (client, server) = pair(echo(), echo(), &pools);

    let mut dst = Vec::new();
    for i in 0..20u8 {
        client.request(&mut dst, &[i]).await.unwrap();
        server.send(&[i]).await.unwrap();
        client.send_no_wait(&[i]).unwrap();
    }
    let _ = client
        .request_with_timeout(&mut dst, b"racing", Duration::from_nanos(1))
        .await;

    client.close();
    client.closed().await;
    server.closed().await;

    let stats = pools.stats();
    for (name, pool) in [
        ("timers", stats.timers),
        ("contexts", stats.contexts),
        ("requests", stats.requests),
        ("writes", stats.writes),
    ] {
        assert_eq!(pool.outstanding(), 0, "{name}: {pool:?}");
    }
    assert!(stats.writes.reused > 0);
}

#[tokio::test]
async fn encrypted_conns_exchange_requests() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let record = RecordConfig::default();
    let server = tokio::spawn(async move {
        let (reader, writer) = establish(b, Role::Acceptor, Security::Encrypted, &record).await?;
        Ok::<_, carrier_crypto::HandshakeError>(
            Conn::builder(Role::Acceptor).handler(echo()).spawn(reader, writer).unwrap(),
        )
    });
    let (reader, writer) =
        establish(a, Role::Initiator, Security::Encrypted, &record).await.unwrap();
    let client = Conn::builder(Role::Initiator).spawn(reader, writer).unwrap();
    let _server = server.await.unwrap().unwrap();

    let mut dst = Vec::new();
    client.request(&mut dst, b"sealed ping").await.unwrap();
    assert_eq!(dst, b"sealed ping");
}

#[tokio::test]
async fn invalid_sequence_config_is_rejected() {
    let (a, _b) = tokio::io::duplex(1024);
    let (reader, writer) = split_plain(a, &RecordConfig::default());
    let config = ConnConfig {
        sequence: Some(SequenceConfig { offset: 2, delta: 2 }),
        ..ConnConfig::default()
    };
    let err = Conn::builder(Role::Initiator).config(config).spawn(reader, writer).unwrap_err();
    assert!(matches!(err, ConnError::Config(_)));
}

#[tokio::test]
async fn custom_sequence_config_is_used() {
    let pools = Arc::new(Pools::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = handler_fn(move |ctx: &mut Context| {
        let _ = tx.send(ctx.seq());
        ctx.reply(b"")?;
        Ok(())
    });

    let (a, b) = tokio::io::duplex(4096);
    let record = RecordConfig::default();
    let (a_read, a_write) = split_plain(a, &record);
    let (b_read, b_write) = split_plain(b, &record);
    let config = ConnConfig {
        sequence: Some(SequenceConfig { offset: 101, delta: 10 }),
        ..ConnConfig::default()
    };
    let client = Conn::builder(Role::Initiator)
        .config(config)
        .pools(Arc::clone(&pools))
        .spawn(a_read, a_write)
        .unwrap();
    let _server = Conn::builder(Role::Acceptor)
        .handler(Arc::new(server))
        .pools(pools)
        .spawn(b_read, b_write)
        .unwrap();

    let mut dst = Vec::new();
    for _ in 0..3 {
        client.request(&mut dst, b"n").await.unwrap();
    }
    let seqs: Vec<u32> = [rx.recv().await, rx.recv().await, rx.recv().await]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(seqs, [101, 111, 121]);
}

#[tokio::test]
async fn write_failure_fails_the_rest_of_the_batch() {
    // The far end stays open and silent so only the writer can end the conn.
    let (a, _b) = tokio::io::duplex(1024);
    let (reader, _) = split_plain(a, &RecordConfig::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let writer = FailingWriter { attempts: Arc::clone(&attempts), fail_at: 2 };
    let conn = Conn::builder(Role::Initiator).spawn(reader, writer).unwrap();

    // All three are queued before the writer task gets to run.
    let (first, second, third) =
        tokio::join!(conn.send(b"one"), conn.send(b"two"), conn.send(b"three"));

    assert!(first.is_ok(), "{first:?}");
    for result in [second, third] {
        match result {
            Err(ConnError::Transport(e)) => assert!(e.to_string().contains("boom"), "{e}"),
            other => panic!("expected a transport error, got {other:?}"),
        }
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    tokio::time::timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert_eq!(conn.state(), ConnState::Closed);

    let mut dst = Vec::new();
    assert!(matches!(conn.request(&mut dst, b"after").await, Err(ConnError::Closed)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn idle_peer_hits_the_read_timeout() {
    let (a, _b) = tokio::io::duplex(1024);
    let (reader, writer) = split_plain(a, &RecordConfig::default());
    let config = ConnConfig { read_timeout: Duration::from_millis(50), ..ConnConfig::default() };
    let conn = Conn::builder(Role::Initiator).config(config).spawn(reader, writer).unwrap();

    let waiter = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut dst = Vec::new();
            conn.request_with_timeout(&mut dst, b"anyone?", Duration::from_secs(60)).await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert_eq!(conn.state(), ConnState::Closed);
    assert!(matches!(waiter.await.unwrap(), Err(ConnError::Closed)));
}

#[tokio::test]
async fn traffic_keeps_the_read_timeout_at_bay() {
    let pools = Arc::new(Pools::new());
    let (a, b) = tokio::io::duplex(64 * 1024);
    let record = RecordConfig::default();
    let (a_read, a_write) = split_plain(a, &record);
    let (b_read, b_write) = split_plain(b, &record);
    let config = ConnConfig { read_timeout: Duration::from_millis(300), ..ConnConfig::default() };
    let client = Conn::builder(Role::Initiator)
        .config(config)
        .pools(Arc::clone(&pools))
        .spawn(a_read, a_write)
        .unwrap();
    let _server = Conn::builder(Role::Acceptor)
        .handler(echo())
        .pools(pools)
        .spawn(b_read, b_write)
        .unwrap();

    let mut dst = Vec::new();
    for i in 0..10u8 {
        client.request(&mut dst, &[i]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(client.is_open());
}
