use crate::bus::{self, Bus, Inbox};
use crate::config::Config;
use crate::gateway::{ResourceId, UdpEvent, UdpGateway, UdpRequest};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

const WAIT: Duration = Duration::from_secs(2);

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Reply to every datagram with "echo:" + payload
async fn spawn_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind(localhost(0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

async fn create_socket(
    gateway: &UdpGateway,
    listener: &Bus<UdpEvent>,
    events: &mut Inbox<UdpEvent>,
) -> (ResourceId, SocketAddr) {
    let id = gateway.next_id(WAIT).await.unwrap();
    gateway
        .bus()
        .send(UdpRequest::CreateSocket {
            id,
            source: localhost(0),
            listener: listener.clone(),
        })
        .unwrap();

    match events.recv_timeout(WAIT).await {
        Some(UdpEvent::Created { id: created, local_addr }) => {
            assert_eq!(created, id);
            (id, local_addr)
        }
        other => panic!("expected Created, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ids_are_unique() {
    let gateway = UdpGateway::spawn(&Config::default());

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(gateway.next_id(WAIT).await.unwrap());
    }
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();

    assert_eq!(sorted.len(), ids.len());
    assert_eq!(sorted, ids);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unspecified_source_is_rejected() {
    let gateway = UdpGateway::spawn(&Config::default());
    let (listener, mut events) = bus::channel();

    let id = gateway.next_id(WAIT).await.unwrap();
    gateway
        .bus()
        .send(UdpRequest::CreateSocket {
            id,
            source: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            listener,
        })
        .unwrap();

    match events.recv_timeout(WAIT).await {
        Some(UdpEvent::Error { id: failed, .. }) => assert_eq!(failed, id),
        other => panic!("expected Error, got {:?}", other),
    }
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_and_read() {
    let echo = spawn_echo_server().await;
    let gateway = UdpGateway::spawn(&Config::default());
    let (listener, mut events) = bus::channel();
    let (id, local_addr) = create_socket(&gateway, &listener, &mut events).await;
    assert_eq!(local_addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_ne!(local_addr.port(), 0);

    gateway
        .bus()
        .send(UdpRequest::Write {
            id,
            destination: echo,
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();

    match events.recv_timeout(WAIT).await {
        Some(UdpEvent::Read {
            id: read_id,
            sender,
            payload,
        }) => {
            assert_eq!(read_id, id);
            assert_eq!(sender, echo);
            assert_eq!(payload.as_ref(), b"echo:hello");
        }
        other => panic!("expected Read, got {:?}", other),
    }
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sockets_are_isolated() {
    let echo = spawn_echo_server().await;
    let gateway = UdpGateway::spawn(&Config::default());
    let (first_listener, mut first_events) = bus::channel();
    let (second_listener, mut second_events) = bus::channel();
    let (first, _) = create_socket(&gateway, &first_listener, &mut first_events).await;
    let (_second, _) = create_socket(&gateway, &second_listener, &mut second_events).await;

    gateway
        .bus()
        .send(UdpRequest::Write {
            id: first,
            destination: echo,
            payload: Bytes::from_static(b"one"),
        })
        .unwrap();

    let event = first_events.recv_timeout(WAIT).await.unwrap();
    assert_eq!(event.id(), first);
    assert!(second_events
        .recv_timeout(Duration::from_millis(100))
        .await
        .is_none());
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_many_datagrams_are_all_sent() {
    let echo = spawn_echo_server().await;
    let gateway = UdpGateway::spawn(&Config::default());
    let (listener, mut events) = bus::channel();
    let (id, _) = create_socket(&gateway, &listener, &mut events).await;

    for n in 0..20u8 {
        gateway
            .bus()
            .send(UdpRequest::Write {
                id,
                destination: echo,
                payload: Bytes::copy_from_slice(&[n]),
            })
            .unwrap();
    }

    let mut received = 0;
    while received < 20 {
        match events.recv_timeout(WAIT).await {
            Some(UdpEvent::Read { .. }) => received += 1,
            Some(other) => panic!("unexpected {:?}", other),
            None => break,
        }
    }
    assert_eq!(received, 20);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_socket_stops_reporting() {
    let gateway = UdpGateway::spawn(&Config::default());
    let (listener, mut events) = bus::channel();
    let (id, local_addr) = create_socket(&gateway, &listener, &mut events).await;

    gateway.bus().send(UdpRequest::Close { id }).unwrap();
    // Round-trip through the worker so the close has been applied.
    gateway.next_id(WAIT).await.unwrap();

    let peer = UdpSocket::bind(localhost(0)).await.unwrap();
    let _ = peer.send_to(b"late", local_addr).await;

    assert!(events
        .recv_timeout(Duration::from_millis(100))
        .await
        .is_none());
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_addresses_exclude_loopback() {
    let gateway = UdpGateway::spawn(&Config::default());

    let addresses = gateway.local_ip_addresses(WAIT).await.unwrap();

    assert!(addresses.iter().all(|ip| !ip.is_loopback()));
    assert!(addresses.iter().all(|ip| !ip.is_unspecified()));
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_with_open_sockets() {
    let gateway = UdpGateway::spawn(&Config::default());
    let (listener, mut events) = bus::channel();
    create_socket(&gateway, &listener, &mut events).await;
    create_socket(&gateway, &listener, &mut events).await;

    gateway.shutdown().await.unwrap();
}
