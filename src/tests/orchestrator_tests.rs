use crate::codec::{Codec, Decoded, FnCodec};
use crate::config::Config;
use crate::gateway::UdpGateway;
use crate::orchestrator::{AttemptSchedule, Delivery, UdpExchange, UdpOrchestrator};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn millis(values: &[u64]) -> AttemptSchedule {
    AttemptSchedule::fixed(values.iter().map(|ms| Duration::from_millis(*ms)))
}

/// Sends the request text; accepts datagrams starting with "re:" + request
fn reply_codec() -> impl Codec<Request = String, Response = String> {
    FnCodec::new(
        |request: &String| Bytes::from(request.clone().into_bytes()),
        |bytes: &[u8]| match std::str::from_utf8(bytes) {
            Ok(text) if text.starts_with("re:") => Decoded::Matched(text.to_string()),
            _ => Decoded::Rejected,
        },
    )
}

/// Accepts only "re:" + `token`
fn token_codec(token: &'static str) -> impl Codec<Request = String, Response = String> {
    FnCodec::new(
        |request: &String| Bytes::from(request.clone().into_bytes()),
        move |bytes: &[u8]| {
            if bytes == format!("re:{}", token).as_bytes() {
                Decoded::Matched(token.to_string())
            } else {
                Decoded::Rejected
            }
        },
    )
}

/// UDP server replying `copies` times with "re:" + payload after ignoring
/// the first `ignore` datagrams; counts every datagram it sees
async fn spawn_server(ignore: usize, copies: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if counter.fetch_add(1, Ordering::SeqCst) < ignore {
                continue;
            }
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            for _ in 0..copies {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });
    (addr, seen)
}

/// Server that never answers itself but reports each client address
async fn spawn_relay() -> (SocketAddr, mpsc::UnboundedReceiver<SocketAddr>) {
    let socket = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
            if tx.send(peer).is_err() {
                break;
            }
        }
    });
    (addr, rx)
}

/// Answer from a different socket to every client address received
fn spawn_third_party(mut clients: mpsc::UnboundedReceiver<SocketAddr>, reply: &'static [u8]) {
    tokio::spawn(async move {
        let socket = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        while let Some(client) = clients.recv().await {
            let _ = socket.send_to(reply, client).await;
        }
    });
}

fn orchestrator(gateway: &UdpGateway) -> UdpOrchestrator {
    UdpOrchestrator::from_config(gateway.bus(), &Config::default())
}

#[tokio::test]
async fn test_single_exchange_round_trip() {
    let (server, _) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "ping".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[500]))
        .await;

    assert_eq!(result[0].responses, vec!["re:ping".to_string()]);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unicast_finishes_early_when_answered() {
    let (server, _) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let start = Instant::now();
    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "fast".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[3000, 3000]))
        .await;

    assert!(result[0].is_answered());
    assert!(start.elapsed() < Duration::from_secs(2));
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_destination_times_out() {
    let (server, seen) = spawn_relay_counting().await;
    let gateway = UdpGateway::spawn(&Config::default());

    let start = Instant::now();
    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "anyone?".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[50]))
        .await;
    let elapsed = start.elapsed();

    assert!(result[0].responses.is_empty());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    gateway.shutdown().await.unwrap();
}

async fn spawn_relay_counting() -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_server(usize::MAX, 0).await
}

#[tokio::test]
async fn test_request_is_resent_each_round() {
    let (server, seen) = spawn_relay_counting().await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "again".to_string(),
        reply_codec(),
    )];
    orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[30, 30, 30]))
        .await;

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lost_first_request_is_retried() {
    let (server, seen) = spawn_server(1, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "retry".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[50, 500]))
        .await;

    assert_eq!(result[0].responses, vec!["re:retry".to_string()]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unicast_accepts_at_most_one_response() {
    let (server, _) = spawn_server(0, 3).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![
        UdpExchange::new(LOCALHOST, server, "a".to_string(), reply_codec()),
        UdpExchange::new(LOCALHOST, server, "b".to_string(), reply_codec()),
    ];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[200]))
        .await;

    for exchange in &result {
        assert_eq!(exchange.responses.len(), 1);
    }
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_responses_correlate_through_codec() {
    let (server, _) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![
        UdpExchange::new(LOCALHOST, server, "left".to_string(), token_codec("left")),
        UdpExchange::new(LOCALHOST, server, "right".to_string(), token_codec("right")),
    ];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[500]))
        .await;

    assert_eq!(result[0].responses, vec!["left".to_string()]);
    assert_eq!(result[1].responses, vec!["right".to_string()]);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unicast_ignores_other_senders() {
    let (relay, clients) = spawn_relay().await;
    spawn_third_party(clients, b"re:impostor");
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        relay,
        "who".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[150]))
        .await;

    assert!(result[0].responses.is_empty());
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_accumulates_from_any_sender() {
    let (relay, clients) = spawn_relay().await;
    spawn_third_party(clients, b"re:neighbour");
    let (server, _) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![
        UdpExchange::new(LOCALHOST, relay, "discover".to_string(), reply_codec()),
        UdpExchange::new(LOCALHOST, server, "discover".to_string(), reply_codec()),
    ];
    let start = Instant::now();
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Broadcast, &millis(&[200, 200]))
        .await;

    // Broadcast keeps listening for the whole schedule.
    assert!(start.elapsed() >= Duration::from_millis(400));
    let mut all: Vec<String> = result
        .iter()
        .flat_map(|exchange| exchange.responses.iter().cloned())
        .collect();
    all.sort();
    all.dedup();
    assert_eq!(all, vec!["re:discover".to_string(), "re:neighbour".to_string()]);
    gateway.shutdown().await.unwrap();
}

/// UDP server answering the n-th datagram with "re:" + n
async fn spawn_counting_server() -> SocketAddr {
    let socket = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let mut nth = 0;
        while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
            nth += 1;
            let _ = socket.send_to(format!("re:{}", nth).as_bytes(), peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_broadcast_keeps_every_round_response_in_order() {
    let server = spawn_counting_server().await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "discover".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Broadcast, &millis(&[100, 100]))
        .await;

    assert_eq!(result[0].responses, vec!["re:1".to_string(), "re:2".to_string()]);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unspecified_destination_is_skipped() {
    let (server, _) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![
        UdpExchange::new(
            LOCALHOST,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), server.port()),
            "nowhere".to_string(),
            reply_codec(),
        ),
        UdpExchange::new(LOCALHOST, server, "somewhere".to_string(), reply_codec()),
    ];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[500]))
        .await;

    assert!(result[0].responses.is_empty());
    assert_eq!(result[1].responses, vec!["re:somewhere".to_string()]);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unbindable_source_leaves_exchange_unanswered() {
    let (server, seen) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    // TEST-NET-3 is never assigned to a local interface.
    let foreign = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));
    let exchanges = vec![
        UdpExchange::new(foreign, server, "x".to_string(), reply_codec()),
        UdpExchange::new(LOCALHOST, server, "y".to_string(), reply_codec()),
    ];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &millis(&[500]))
        .await;

    assert!(result[0].responses.is_empty());
    assert!(result[1].is_answered());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_schedule_sends_nothing() {
    let (server, seen) = spawn_server(0, 1).await;
    let gateway = UdpGateway::spawn(&Config::default());

    let exchanges = vec![UdpExchange::new(
        LOCALHOST,
        server,
        "never".to_string(),
        reply_codec(),
    )];
    let result = orchestrator(&gateway)
        .run(exchanges, Delivery::Unicast, &AttemptSchedule::default())
        .await;

    assert!(result[0].responses.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    gateway.shutdown().await.unwrap();
}

#[test]
fn test_exponential_schedule() {
    let schedule = AttemptSchedule::exponential(3, Duration::from_millis(100));
    assert_eq!(
        schedule.durations(),
        &[
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );
    assert_eq!(schedule.total(), Duration::from_millis(700));
    assert_eq!(schedule.len(), 3);
}

#[test]
fn test_exponential_schedule_saturates() {
    let schedule = AttemptSchedule::exponential(80, Duration::from_secs(1));
    assert_eq!(schedule.len(), 80);
    assert_eq!(schedule.durations()[79], Duration::MAX);
    assert_eq!(schedule.total(), Duration::MAX);
}

#[test]
fn test_empty_schedule() {
    let schedule = AttemptSchedule::exponential(0, Duration::from_secs(1));
    assert!(schedule.is_empty());
    assert_eq!(schedule.total(), Duration::ZERO);
}
