use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_fabric::{
    codec::{BincodeCodec, JsonCodec},
    connection::Connection,
    error::Error,
    transport::{
        Delivery, TcpTransport, TcpTransportListener, Transport, TransportListener, UdpConfig,
        UdpTransport, UdpTransportListener, UnixTransport, UnixTransportListener,
    },
};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TestMessage {
    id: u32,
    data: String,
}

/// Helper to get a free port
async fn get_listener() -> (TcpTransportListener, std::net::SocketAddr) {
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn get_udp_listener() -> (UdpTransportListener, std::net::SocketAddr) {
    let listener = UdpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn tcp_send_receive_single_message() {
    let (listener, addr) = get_listener().await;

    // Spawn server
    tokio::spawn(async move {
        let (mut transport, _addr) = listener.accept().await.unwrap();
        let received = transport.receive().await.unwrap();
        transport.send(&received).await.unwrap(); // Echo back
    });

    // Client
    let mut client = TcpTransport::connect(addr).await.unwrap();
    let msg = b"hello world";
    client.send(msg).await.unwrap();
    let response = client.receive().await.unwrap();

    assert_eq!(response, msg);
}

#[tokio::test]
async fn tcp_multiple_messages_preserve_boundaries() {
    let (listener, addr) = get_listener().await;

    tokio::spawn(async move {
        let (mut transport, _addr) = listener.accept().await.unwrap();
        for _ in 0..3 {
            let msg = transport.receive().await.unwrap();
            transport.send(&msg).await.unwrap();
        }
    });

    let mut client = TcpTransport::connect(addr).await.unwrap();
    let messages = vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];

    for msg in &messages {
        client.send(msg).await.unwrap();
        let response = client.receive().await.unwrap();
        assert_eq!(&response, msg);
    }
}

#[tokio::test]
async fn tcp_receive_timeout_fires() {
    let (listener, addr) = get_listener().await;

    // Spawn server that never responds
    tokio::spawn(async move {
        let (_transport, _addr) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let mut client = TcpTransport::builder()
        .address(addr)
        .receive_timeout(Duration::from_millis(100))
        .connect()
        .await
        .unwrap();

    client.send(b"hello").await.unwrap();

    match client.receive().await {
        Err(Error::Timeout(what)) => assert_eq!(what, "Receive"),
        other => panic!("Expected timeout error, got {:?}", other),
    }
}

#[tokio::test]
async fn tcp_rejects_oversized_frame() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // Server writes a frame header claiming 200MB (over the 100MB limit)
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_u32(200 * 1024 * 1024).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let mut client = TcpTransport::connect(addr).await.unwrap();

    match client.receive().await {
        Err(Error::InvalidFrame(msg)) => assert!(msg.contains("too large")),
        other => panic!("Expected InvalidFrame error, got {:?}", other),
    }
}

#[tokio::test]
async fn tcp_builder_limits_frame_size() {
    let (listener, addr) = get_listener().await;

    tokio::spawn(async move {
        let (mut transport, _addr) = listener.accept().await.unwrap();
        transport.send(&[1u8; 64]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let mut client = TcpTransport::builder()
        .address(addr)
        .max_frame_size(32)
        .connect()
        .await
        .unwrap();

    assert!(matches!(client.receive().await, Err(Error::InvalidFrame(_))));
}

#[tokio::test]
async fn connection_with_codec_roundtrip() {
    let (listener, addr) = get_listener().await;

    let expected_msg = TestMessage {
        id: 42,
        data: "test data".to_string(),
    };
    let expected_clone = expected_msg.clone();

    tokio::spawn(async move {
        let (transport, _addr) = listener.accept().await.unwrap();
        let mut connection = Connection::from_transport(transport, BincodeCodec);

        let msg: TestMessage = connection.receive().await.unwrap();
        connection.send(&msg).await.unwrap();
    });

    let transport = TcpTransport::connect(addr).await.unwrap();
    let mut connection = Connection::from_transport(transport, BincodeCodec);

    connection.send(&expected_msg).await.unwrap();
    let response: TestMessage = connection.receive().await.unwrap();

    assert_eq!(response, expected_clone);
}

#[tokio::test]
async fn split_connection_halves_work_independently() {
    let (listener, addr) = get_listener().await;

    tokio::spawn(async move {
        let (transport, _addr) = listener.accept().await.unwrap();
        let mut connection = Connection::from_transport(transport, JsonCodec);
        for _ in 0..2 {
            let msg: TestMessage = connection.receive().await.unwrap();
            connection.send(&msg).await.unwrap();
        }
    });

    let connection = Connection::tcp(addr, JsonCodec).await.unwrap();
    let (mut sender, mut receiver) = connection.into_split();
    assert!(!receiver.resynchronizes());

    let reader = tokio::spawn(async move {
        let mut ids = Vec::new();
        for _ in 0..2 {
            let msg: TestMessage = receiver.receive().await.unwrap();
            ids.push(msg.id);
        }
        ids
    });

    for id in [1, 2] {
        sender
            .send(&TestMessage {
                id,
                data: "split".into(),
            })
            .await
            .unwrap();
    }

    assert_eq!(reader.await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn codec_error_leaves_the_stream_usable() {
    let (listener, addr) = get_listener().await;

    tokio::spawn(async move {
        let (mut transport, _addr) = listener.accept().await.unwrap();
        transport.send(b"not json").await.unwrap();
        transport
            .send(br#"{"id":7,"data":"ok"}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let mut connection = Connection::tcp(addr, JsonCodec).await.unwrap();
    let first = connection.receive::<TestMessage>().await;
    assert!(matches!(first, Err(Error::Codec(_))));
    let second: TestMessage = connection.receive().await.unwrap();
    assert_eq!(second.id, 7);
}

#[tokio::test]
async fn connection_closed_error() {
    let (listener, addr) = get_listener().await;

    // Spawn server that immediately closes
    tokio::spawn(async move {
        let (mut transport, _addr) = listener.accept().await.unwrap();
        transport.close().await.unwrap();
    });

    let mut client = TcpTransport::connect(addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    match client.receive().await {
        Err(Error::ConnectionClosed) => {}
        other => panic!("Expected ConnectionClosed, got {:?}", other),
    }
}

#[tokio::test]
async fn transport_listener_trait_usage() {
    let (mut listener, addr) = get_listener().await;

    async fn accept_generic<L: TransportListener>(listener: &L) -> Result<L::Transport, Error> {
        listener.accept().await
    }

    tokio::spawn(async move {
        let mut client = TcpTransport::connect(addr).await.unwrap();
        client.send(b"test").await.unwrap();
    });

    let mut transport = accept_generic(&listener).await.unwrap();
    let msg = transport.receive().await.unwrap();
    assert_eq!(msg, b"test");

    TransportListener::close(&mut listener).await.unwrap();
}

// Unix Socket Tests

#[tokio::test]
async fn unix_send_receive_single_message() {
    let socket_path = "/tmp/tether_test_unix_single.sock";
    let _ = std::fs::remove_file(socket_path);

    let listener = UnixTransportListener::bind(socket_path).await.unwrap();

    tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        let received = transport.receive().await.unwrap();
        transport.send(&received).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = UnixTransport::connect(socket_path).await.unwrap();
    let msg = b"hello unix";
    client.send(msg).await.unwrap();
    let response = client.receive().await.unwrap();

    assert_eq!(response, msg);

    let _ = std::fs::remove_file(socket_path);
}

#[tokio::test]
async fn unix_listener_cleans_up_socket() {
    let socket_path = "/tmp/tether_test_unix_cleanup.sock";
    let _ = std::fs::remove_file(socket_path);

    {
        let mut listener = UnixTransportListener::bind(socket_path).await.unwrap();
        assert!(std::path::Path::new(socket_path).exists());

        listener.close().await.unwrap();
    }

    assert!(!std::path::Path::new(socket_path).exists());
}

#[tokio::test]
async fn unix_timeout_works() {
    let socket_path = "/tmp/tether_test_unix_timeout.sock";
    let _ = std::fs::remove_file(socket_path);

    let listener = UnixTransportListener::bind(socket_path).await.unwrap();

    tokio::spawn(async move {
        let _transport = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = UnixTransport::builder()
        .path(socket_path)
        .receive_timeout(Duration::from_millis(100))
        .connect()
        .await
        .unwrap();

    client.send(b"hello").await.unwrap();

    assert!(matches!(client.receive().await, Err(Error::Timeout(_))));

    let _ = std::fs::remove_file(socket_path);
}

// UDP Tests

#[tokio::test]
async fn udp_reliable_ordered_echo() {
    let (listener, addr) = get_udp_listener().await;

    tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        for _ in 0..3 {
            let msg = transport.receive().await.unwrap();
            transport.send(&msg).await.unwrap();
        }
    });

    let mut client = UdpTransport::connect(addr).await.unwrap();
    for msg in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        client.send(&msg).await.unwrap();
    }
    for expected in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        assert_eq!(client.receive().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn udp_each_peer_is_its_own_connection() {
    let (listener, addr) = get_udp_listener().await;

    tokio::spawn(async move {
        for _ in 0..2 {
            let mut transport = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let msg = transport.receive().await.unwrap();
                transport.send(&msg).await.unwrap();
            });
        }
    });

    let mut a = UdpTransport::connect(addr).await.unwrap();
    let mut b = UdpTransport::connect(addr).await.unwrap();
    a.send(b"from a").await.unwrap();
    b.send(b"from b").await.unwrap();

    assert_eq!(a.receive().await.unwrap(), b"from a");
    assert_eq!(b.receive().await.unwrap(), b"from b");
}

#[tokio::test]
async fn udp_unreliable_send_is_delivered_on_loopback() {
    let (listener, addr) = get_udp_listener().await;

    let server = tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        transport.receive().await.unwrap()
    });

    let mut client = UdpTransport::connect(addr).await.unwrap();
    client
        .send_with(b"best effort", Delivery::Unreliable)
        .await
        .unwrap();

    assert_eq!(server.await.unwrap(), b"best effort");
}

#[tokio::test]
async fn udp_rejects_oversized_payload() {
    let (_listener, addr) = get_udp_listener().await;

    let mut client = UdpTransport::builder()
        .address(addr)
        .max_datagram_size(16)
        .connect()
        .await
        .unwrap();

    assert!(matches!(
        client.send(&[0u8; 17]).await,
        Err(Error::InvalidFrame(_))
    ));
}

#[tokio::test]
async fn udp_close_reaches_the_peer() {
    let (listener, addr) = get_udp_listener().await;

    let server = tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        let first = transport.receive().await.unwrap();
        let next = transport.receive().await;
        (first, next)
    });

    let mut client = UdpTransport::connect(addr).await.unwrap();
    client.send(b"bye").await.unwrap();
    // give the reliable datagram a chance to be acknowledged first
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await.unwrap();

    let (first, next) = server.await.unwrap();
    assert_eq!(first, b"bye");
    assert!(matches!(next, Err(Error::ConnectionClosed)));
    assert!(matches!(client.send(b"late").await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn udp_unanswered_reliable_send_declares_peer_lost() {
    // Bound but never read, so nothing is ever acknowledged
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let mut client = UdpTransport::builder()
        .config(UdpConfig {
            resend_interval_ms: 10,
            max_resends: 3,
            ..UdpConfig::default()
        })
        .address(addr)
        .connect()
        .await
        .unwrap();

    client.send(b"anyone?").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), client.receive())
        .await
        .expect("receive should fail once the peer is lost");
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn udp_close_keeps_resending_until_the_linger_runs_out() {
    // A peer that reads everything and acknowledges nothing
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();
    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
        while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, peer.recv(&mut buf)).await {
            seen.push(buf[..n].to_vec());
        }
        seen
    });

    let mut client = UdpTransport::builder()
        .address(addr)
        .resend_interval(Duration::from_millis(30))
        .close_linger(Duration::from_millis(300))
        .connect()
        .await
        .unwrap();
    client
        .send_with(b"important", Delivery::ReliableOrdered)
        .await
        .unwrap();
    client.close().await.unwrap();

    let seen = collector.await.unwrap();
    let data = seen.iter().filter(|d| d[0] == 0).count();
    assert!(data >= 2, "expected resends during the linger, saw {data}");
    // the close comes last and takes the next ordered sequence number
    assert_eq!(seen.last().unwrap()[..6], [2, 2, 0, 0, 0, 1]);
}

#[tokio::test]
async fn udp_silent_peer_is_dropped_after_the_idle_timeout() {
    let config = UdpConfig {
        keepalive_interval_ms: 50,
        idle_timeout_ms: 300,
        ..UdpConfig::default()
    };
    let listener = UdpTransportListener::bind_with("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    // one reliable ordered datagram, then silence
    let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(&[0, 2, 0, 0, 0, 0, b'h', b'i'], addr)
        .await
        .unwrap();

    let mut server = listener.accept().await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"hi");
    let next = tokio::time::timeout(Duration::from_secs(2), server.receive())
        .await
        .expect("a silent peer should be declared lost");
    assert!(matches!(next, Err(Error::ConnectionClosed)));
    drop(raw);
}

#[tokio::test]
async fn udp_keepalive_holds_an_idle_connection_open() {
    let config = UdpConfig {
        keepalive_interval_ms: 50,
        idle_timeout_ms: 300,
        ..UdpConfig::default()
    };
    let listener = UdpTransportListener::bind_with("127.0.0.1:0".parse().unwrap(), config.clone())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        while let Ok(msg) = transport.receive().await {
            if transport.send(&msg).await.is_err() {
                break;
            }
        }
    });

    let client = UdpTransport::builder()
        .config(config)
        .address(addr)
        .connect()
        .await
        .unwrap();
    let (mut tx, mut rx) = (Box::new(client) as Box<dyn Transport>).into_split();
    tx.send(b"hello").await.unwrap();
    assert_eq!(rx.receive().await.unwrap(), b"hello");

    // idle well past the timeout while both sides keep reading
    let (echo, sent) = tokio::join!(rx.receive(), async {
        tokio::time::sleep(Duration::from_millis(800)).await;
        tx.send(b"still here").await
    });
    sent.unwrap();
    assert_eq!(echo.unwrap(), b"still here");
}
