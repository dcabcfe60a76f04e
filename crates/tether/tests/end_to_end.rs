//! End-to-end client/server tests over real TCP on ephemeral ports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tether::{
    CallError, Client, ClientConfig, PendingReply, Request, Response, Server, ServerConfig,
    SocketEventListener, TokioScheduler,
};

fn server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        liveness_period: Duration::from_millis(100),
        ..Default::default()
    }
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        address: addr.ip().to_string(),
        port: addr.port(),
        scanner_period: Duration::from_millis(100),
        scanner_initial_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

fn echo(request: Request) -> Option<Response> {
    Some(Response {
        sequence: request.sequence,
        code: 0,
        payload: request.payload,
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn echo_round_trip() {
    let server = Server::bind(server_config()).await.unwrap();
    server.register_fn(1, |_ctx, request| async move { echo(request) });

    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();
    let response = client
        .call(1, Bytes::from_static(b"hello"), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response.code, 0);
    assert_eq!(response.payload, Bytes::from_static(b"hello"));
    assert_eq!(client.outstanding_calls(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn one_way_requests_count_without_registering_calls() {
    let server = Server::bind(server_config()).await.unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    server.register_fn(2, move |_ctx, _request| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            None
        }
    });

    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();
    for _ in 0..16 {
        client.notify(2, Bytes::new()).await.unwrap();
    }

    wait_until(|| counter.load(Ordering::SeqCst) == 16).await;
    assert_eq!(client.outstanding_calls(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn unanswered_call_times_out_within_a_scanner_period() {
    // No handler registered for code 7: the server logs and stays silent.
    let server = Server::bind(server_config()).await.unwrap();
    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();

    let started = Instant::now();
    let err = client
        .call(7, Bytes::new(), Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, CallError::Timeout { .. }), "got {err}");
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");

    // The scanner reclaims the abandoned table entry.
    wait_until(|| client.outstanding_calls() == 0).await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn call_after_peer_death_is_a_send_error_not_a_timeout() {
    let server = Server::bind(server_config()).await.unwrap();
    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();

    server.shutdown().await;
    drop(server);
    // Let the client's receive loop observe the close.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client
        .call(1, Bytes::from_static(b"x"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(
        matches!(err, CallError::Send(_) | CallError::Closed),
        "got {err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_resolve_in_response_order() {
    let server = Server::bind(server_config()).await.unwrap();
    for (code, delay_ms) in [(10i32, 300u64), (11, 200), (12, 100)] {
        server.register_fn(code, move |_ctx, request| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            echo(request)
        });
    }

    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();
    let slow = client
        .submit(10, Bytes::from_static(b"a"), Duration::from_secs(2))
        .await
        .unwrap();
    let medium = client
        .submit(11, Bytes::from_static(b"b"), Duration::from_secs(2))
        .await
        .unwrap();
    let fast = client
        .submit(12, Bytes::from_static(b"c"), Duration::from_secs(2))
        .await
        .unwrap();
    let sequences = (slow.sequence(), medium.sequence(), fast.sequence());

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    async fn resolve(
        label: &'static str,
        reply: PendingReply,
        order: Arc<Mutex<Vec<&'static str>>>,
    ) -> Response {
        let response = reply.wait().await.unwrap();
        order.lock().unwrap().push(label);
        response
    }

    let (a, b, c) = tokio::join!(
        resolve("a", slow, order.clone()),
        resolve("b", medium, order.clone()),
        resolve("c", fast, order.clone()),
    );

    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    assert_eq!(a.sequence, sequences.0);
    assert_eq!(b.sequence, sequences.1);
    assert_eq!(c.sequence, sequences.2);
    assert_eq!(a.payload, Bytes::from_static(b"a"));
    assert_eq!(b.payload, Bytes::from_static(b"b"));
    assert_eq!(c.payload, Bytes::from_static(b"c"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn fragmented_response_reassembles_into_one_frame() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = Bytes::from(vec![0x5Au8; 10 * 1024]);
    let expected = payload.clone();

    // A hand-rolled peer that answers the first request one byte at a time.
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes(header) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        let request = Request::decode(Bytes::from(body)).unwrap();

        let response = Response {
            sequence: request.sequence,
            code: 0,
            payload,
        };
        let body = response.encode();
        let mut wire = Vec::with_capacity(4 + body.len());
        wire.extend_from_slice(&(body.len() as u32).to_le_bytes());
        wire.extend_from_slice(&body);
        for byte in wire {
            stream.write_all(&[byte]).await.unwrap();
            stream.flush().await.unwrap();
        }

        // Hold the socket open until the client is done with it.
        let mut sink = [0u8; 1];
        let _ = stream.read(&mut sink).await;
    });

    let mut config = client_config(addr);
    config.receive_buffer_size = 64;
    let client = Client::connect(config).await.unwrap();
    let response = client
        .call(1, Bytes::new(), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(response.payload.len(), expected.len());
    assert_eq!(response.payload, expected);

    client.shutdown().await;
    peer.await.unwrap();
}

#[tokio::test]
async fn deferred_reply_through_the_request_context() {
    let server = Server::bind(server_config()).await.unwrap();
    server.register_fn(5, |ctx, request| async move {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let reply = Response {
                sequence: request.sequence,
                code: 7,
                payload: Bytes::new(),
            };
            ctx.send_response(reply).await.unwrap();
        });
        None
    });

    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();
    let response = client
        .call(5, Bytes::new(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.code, 7);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn event_listener_sees_accept_and_disconnect() {
    #[derive(Default)]
    struct Recorder {
        accepted: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl SocketEventListener for Recorder {
        fn on_accept(&self, _peer: SocketAddr) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnect(&self, _peer: SocketAddr) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    let events = Arc::new(Recorder::default());
    let server = Server::bind_with(
        server_config(),
        Arc::new(TokioScheduler),
        Some(events.clone() as Arc<dyn SocketEventListener>),
    )
    .await
    .unwrap();

    let client = Client::connect(client_config(server.local_addr()))
        .await
        .unwrap();
    wait_until(|| events.accepted.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.connection_count(), 1);

    client.shutdown().await;
    wait_until(|| events.disconnected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.connection_count(), 0);

    server.shutdown().await;
}
