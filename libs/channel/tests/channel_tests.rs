use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_channel::{
    spawn_actor, Actor, ActorContext, ActorHandle, ActorId, BoundType, CallError, ChannelConfig,
    ChannelFactory, ChannelHandle, ChannelState, Error, Gateway, Mailbox, Notification,
    ObserverId, ObserverRef, Payload, RemoteError, RequestMessage,
};
use tether_fabric::codec::{BincodeCodec, Codec, JsonCodec};
use tether_channel::Hello;
use tether_fabric::transport::{
    TcpTransportListener, UdpConfig, UdpTransportListener, UnixTransportListener,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Interface {
    Entry,
    Greeter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Message {
    GetGreeter,
    GreeterBound(ActorId),
    Greet(String),
    Greeting(String),
    Subscribe(ObserverRef<Message>),
    Unsubscribe(ObserverId),
    Greeted(String),
    Fail,
}

impl Payload for Message {
    type Interface = Interface;

    fn interface(&self) -> Option<Interface> {
        match self {
            Message::GetGreeter => Some(Interface::Entry),
            Message::Greet(_)
            | Message::Subscribe(_)
            | Message::Unsubscribe(_)
            | Message::Fail => Some(Interface::Greeter),
            Message::GreeterBound(_) | Message::Greeting(_) | Message::Greeted(_) => None,
        }
    }

    fn bind_observers(self, channel: &tether_channel::NotificationChannel<Self>) -> Self {
        match self {
            Message::Subscribe(observer) => Message::Subscribe(observer.bound_to(channel)),
            other => other,
        }
    }
}

/// Hands out a fresh greeter per caller
struct EntryActor;

#[async_trait]
impl Actor<Message> for EntryActor {
    async fn handle(
        &mut self,
        payload: Message,
        ctx: &ActorContext<Message>,
    ) -> Result<Option<Message>, RemoteError> {
        match payload {
            Message::GetGreeter => {
                let id = ctx
                    .bind_child(GreeterActor::default(), [Interface::Greeter])
                    .await
                    .map_err(|e| RemoteError::application(e.to_string()))?;
                Ok(Some(Message::GreeterBound(id)))
            }
            other => Err(RemoteError::BadRequest(format!("{other:?}"))),
        }
    }
}

#[derive(Default)]
struct GreeterActor {
    observers: Vec<ObserverRef<Message>>,
    notifications: u32,
}

#[async_trait]
impl Actor<Message> for GreeterActor {
    async fn handle(
        &mut self,
        payload: Message,
        _ctx: &ActorContext<Message>,
    ) -> Result<Option<Message>, RemoteError> {
        match payload {
            Message::Greet(name) => {
                for observer in &self.observers {
                    self.notifications += 1;
                    let _ = observer.notify(self.notifications, Message::Greeted(name.clone()));
                }
                Ok(Some(Message::Greeting(format!("Hello {name}"))))
            }
            Message::Subscribe(observer) => {
                self.observers.push(observer);
                Ok(None)
            }
            Message::Unsubscribe(id) => {
                self.observers.retain(|observer| observer.id() != id);
                Ok(None)
            }
            Message::Fail => Err(RemoteError::application("greeter refused")),
            other => Err(RemoteError::BadRequest(format!("{other:?}"))),
        }
    }
}

/// Reports when it stops
struct Watched {
    stopped: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl Actor<Message> for Watched {
    async fn handle(
        &mut self,
        _payload: Message,
        _ctx: &ActorContext<Message>,
    ) -> Result<Option<Message>, RemoteError> {
        Ok(None)
    }

    async fn on_stop(&mut self) {
        let _ = self.stopped.send(());
    }
}

/// Accepts requests and never answers them
#[derive(Default)]
struct Silent(Mutex<Vec<RequestMessage<Message>>>);

impl Mailbox<Message> for Silent {
    fn tell(&self, message: RequestMessage<Message>) {
        self.0.lock().push(message);
    }
}

/// Forwards every request to the test
struct Recorder(mpsc::UnboundedSender<Message>);

impl Mailbox<Message> for Recorder {
    fn tell(&self, message: RequestMessage<Message>) {
        let _ = self.0.send(message.payload);
    }
}

const ENTRY: ActorId = 1;
const SILENT: ActorId = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Entry actor at id 1, a silent actor at id 2
fn greeter_gateway<C: Codec + Clone + 'static>(codec: C) -> Gateway<Message, C> {
    Gateway::new(codec).with_initial_actors(|channel: &ChannelHandle<Message>| {
        vec![
            (
                spawn_actor(EntryActor, channel.clone()),
                vec![BoundType::new(Interface::Entry)],
            ),
            (
                ActorHandle::from_mailbox(Silent::default()),
                vec![BoundType::new(Interface::Greeter)],
            ),
        ]
    })
}

async fn serve_tcp(gateway: Gateway<Message, BincodeCodec>) -> SocketAddr {
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = gateway.serve(&listener).await;
    });
    addr
}

fn connect<C: Codec + Clone + 'static>(mut config: ChannelConfig, codec: C) -> ChannelHandle<Message> {
    config.request_timeout_ms = Some(5_000);
    ChannelFactory::new(config, codec).create().unwrap()
}

async fn greeter(client: &ChannelHandle<Message>) -> ActorId {
    match client.call(ENTRY, Message::GetGreeter).await.unwrap() {
        Some(Message::GreeterBound(id)) => id,
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn tcp_greeter_round_trip() {
    init_tracing();
    let addr = serve_tcp(greeter_gateway(BincodeCodec)).await;
    let client = connect(ChannelConfig::tcp(addr.to_string()), BincodeCodec);
    client.opened().await.unwrap();

    let id = greeter(&client).await;
    assert!(id > SILENT);

    let reply = client
        .call(id, Message::Greet("World".to_string()))
        .await
        .unwrap();
    assert_eq!(reply, Some(Message::Greeting("Hello World".to_string())));

    client.close().await;
    assert_eq!(client.state(), ChannelState::Closed);
}

#[tokio::test]
async fn observer_receives_notifications_until_unsubscribed() {
    init_tracing();
    let addr = serve_tcp(greeter_gateway(BincodeCodec)).await;
    let client = connect(ChannelConfig::tcp(addr.to_string()), BincodeCodec);
    let id = greeter(&client).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Notification<Message>>();
    let observer = client.subscribe(tx).await.unwrap();
    client
        .call(id, Message::Subscribe(observer.clone()))
        .await
        .unwrap();

    client
        .call(id, Message::Greet("World".to_string()))
        .await
        .unwrap();
    let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.observer_id, observer.id());
    assert_eq!(notification.payload, Message::Greeted("World".to_string()));

    client
        .call(id, Message::Unsubscribe(observer.id()))
        .await
        .unwrap();
    client.unsubscribe(observer.id()).unwrap();
    client
        .call(id, Message::Greet("again".to_string()))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn routing_and_application_errors_reach_the_caller() {
    init_tracing();
    let addr = serve_tcp(greeter_gateway(BincodeCodec)).await;
    let client = connect(ChannelConfig::tcp(addr.to_string()), BincodeCodec);
    let id = greeter(&client).await;

    assert!(matches!(
        client.call(999, Message::GetGreeter).await,
        Err(Error::Call(CallError::Remote(RemoteError::TargetNotFound)))
    ));
    assert!(matches!(
        client.call(ENTRY, Message::Greet("x".to_string())).await,
        Err(Error::Call(CallError::Remote(RemoteError::HandlerNotFound)))
    ));
    assert!(matches!(
        client.call(id, Message::Fail).await,
        Err(Error::Call(CallError::Remote(RemoteError::Application(_))))
    ));

    // the channel survives all of the above
    assert_eq!(
        client.call(id, Message::Greet("still".to_string())).await.unwrap(),
        Some(Message::Greeting("Hello still".to_string()))
    );
}

#[tokio::test]
async fn udp_greeter_round_trip() {
    init_tracing();
    let listener = UdpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = greeter_gateway(BincodeCodec);
    tokio::spawn(async move {
        let _ = gateway.serve(&listener).await;
    });

    let client = connect(ChannelConfig::udp(addr.to_string()), BincodeCodec);
    let id = greeter(&client).await;
    let reply = client
        .call(id, Message::Greet("UDP".to_string()))
        .await
        .unwrap();
    assert_eq!(reply, Some(Message::Greeting("Hello UDP".to_string())));
    client.close().await;
}

#[tokio::test]
async fn unix_socket_with_json_codec() {
    init_tracing();
    let path = "/tmp/tether_channel_json.sock";
    let _ = std::fs::remove_file(path);
    let listener = UnixTransportListener::bind(path).await.unwrap();
    let gateway = greeter_gateway(JsonCodec);
    tokio::spawn(async move {
        let _ = gateway.serve(&listener).await;
    });

    let client = connect(ChannelConfig::unix(path), JsonCodec);
    let id = greeter(&client).await;
    let reply = client
        .call(id, Message::Greet("JSON".to_string()))
        .await
        .unwrap();
    assert_eq!(reply, Some(Message::Greeting("Hello JSON".to_string())));
}

#[tokio::test]
async fn connect_token_binds_the_reserved_actor_first() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let gateway = greeter_gateway(BincodeCodec);
    gateway.register_token("vip", move |_: &ChannelHandle<Message>| {
        (
            ActorHandle::from_mailbox(Recorder(tx)),
            vec![BoundType::new(Interface::Greeter)],
        )
    });
    let addr = serve_tcp(gateway).await;

    let mut config = ChannelConfig::tcp(addr.to_string());
    config.connect_token = Some("vip".to_string());
    let client = connect(config, BincodeCodec);

    client.tell(1, Message::Greet("vip".to_string())).unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        Message::Greet("vip".to_string())
    );

    // the entry actor moved up by one
    let reply = client.call(2, Message::GetGreeter).await.unwrap();
    assert!(matches!(reply, Some(Message::GreeterBound(_))));
}

#[tokio::test]
async fn server_close_fails_outstanding_calls() {
    init_tracing();
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = greeter_gateway(BincodeCodec);

    let client = connect(ChannelConfig::tcp(addr.to_string()), BincodeCodec);
    let (transport, _peer) = listener.accept().await.unwrap();
    let server = gateway.accept(transport);
    server.opened().await.unwrap();

    let pending = client
        .send_request(SILENT, Message::Greet("anyone?".to_string()))
        .await
        .unwrap();
    server.close().await;

    assert_eq!(pending.wait().await, Err(CallError::ChannelClosed));
    client.closed().await;
    assert!(matches!(
        client.call(ENTRY, Message::GetGreeter).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn actors_stop_when_their_channel_closes() {
    init_tracing();
    let (stopped_tx, mut stopped) = mpsc::unbounded_channel();
    let gateway = Gateway::new(BincodeCodec).with_initial_actors(move |channel: &ChannelHandle<Message>| {
        let watched = Watched {
            stopped: stopped_tx.clone(),
        };
        vec![(
            spawn_actor(watched, channel.clone()),
            vec![BoundType::new(Interface::Greeter)],
        )]
    });
    let addr = serve_tcp(gateway).await;

    let client = connect(ChannelConfig::tcp(addr.to_string()), BincodeCodec);
    assert_eq!(
        client.call(1, Message::Greet("hi".to_string())).await.unwrap(),
        None
    );
    client.close().await;

    tokio::time::timeout(Duration::from_secs(5), stopped.recv())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn timed_out_call_does_not_poison_the_channel() {
    init_tracing();
    let addr = serve_tcp(greeter_gateway(BincodeCodec)).await;
    let client = connect(ChannelConfig::tcp(addr.to_string()), BincodeCodec);
    let id = greeter(&client).await;

    let pending = client
        .send_request(SILENT, Message::Greet("void".to_string()))
        .await
        .unwrap();
    assert_eq!(
        pending.wait_timeout(Duration::from_millis(50)).await,
        Err(CallError::Timeout)
    );

    assert_eq!(
        client.call(id, Message::Greet("after".to_string())).await.unwrap(),
        Some(Message::Greeting("Hello after".to_string()))
    );
}

#[tokio::test]
async fn token_actor_is_spawned_on_the_channel_that_presents_it() {
    init_tracing();
    let gateway = greeter_gateway(BincodeCodec);
    gateway.register_token("own", |channel: &ChannelHandle<Message>| {
        (
            spawn_actor(GreeterActor::default(), channel.clone()),
            vec![BoundType::new(Interface::Greeter)],
        )
    });
    let addr = serve_tcp(gateway).await;

    let mut config = ChannelConfig::tcp(addr.to_string());
    config.connect_token = Some("own".to_string());
    let client = connect(config, BincodeCodec);

    assert_eq!(
        client.call(1, Message::Greet("token".to_string())).await.unwrap(),
        Some(Message::Greeting("Hello token".to_string()))
    );
}

/// Gateway that hands every accepted server channel to the test
fn capturing_gateway(
    codec: BincodeCodec,
) -> (
    Gateway<Message, BincodeCodec>,
    mpsc::UnboundedReceiver<ChannelHandle<Message>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let gateway = Gateway::new(codec).with_initial_actors(move |channel: &ChannelHandle<Message>| {
        let _ = tx.send(channel.clone());
        Vec::new()
    });
    (gateway, rx)
}

#[tokio::test]
async fn oversized_udp_request_fails_without_closing_the_channel() {
    init_tracing();
    let listener = UdpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = greeter_gateway(BincodeCodec);
    tokio::spawn(async move {
        let _ = gateway.serve(&listener).await;
    });

    let mut config = ChannelConfig::udp(addr.to_string());
    config.udp.max_datagram_size = 256;
    let client = connect(config, BincodeCodec);
    let id = greeter(&client).await;

    let pending = client
        .send_request(id, Message::Greet("x".repeat(1024)))
        .await
        .unwrap();
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(5), pending.wait())
            .await
            .unwrap(),
        Err(CallError::NotSent(_))
    ));
    assert_eq!(client.state(), ChannelState::Open);

    assert_eq!(
        client.call(id, Message::Greet("small".to_string())).await.unwrap(),
        Some(Message::Greeting("Hello small".to_string()))
    );
    client.close().await;
}

#[tokio::test]
async fn silent_udp_peer_closes_its_server_channel() {
    init_tracing();
    let config = UdpConfig {
        keepalive_interval_ms: 50,
        idle_timeout_ms: 300,
        ..UdpConfig::default()
    };
    let listener = UdpTransportListener::bind_with("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (gateway, mut accepted) = capturing_gateway(BincodeCodec);
    tokio::spawn(async move {
        let _ = gateway.serve(&listener).await;
    });

    // one reliable ordered hello, then nothing
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0, 2, 0, 0, 0, 0];
    datagram.extend(BincodeCodec.encode(&Hello::default()).unwrap());
    peer.send_to(&datagram, addr).await.unwrap();

    let server = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert_eq!(server.state(), ChannelState::Closed);
}

#[tokio::test]
async fn oversized_tcp_frame_closes_the_server_channel() {
    init_tracing();
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (gateway, mut accepted) = capturing_gateway(BincodeCodec);
    tokio::spawn(async move {
        let _ = gateway.serve(&listener).await;
    });

    let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
    let hello = BincodeCodec.encode(&Hello::default()).unwrap();
    peer.write_u32(hello.len() as u32).await.unwrap();
    peer.write_all(&hello).await.unwrap();

    let server = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    server.opened().await.unwrap();
    let pending = server
        .send_request(1, Message::Greet("anyone?".to_string()))
        .await
        .unwrap();

    peer.write_u32(u32::MAX).await.unwrap();
    peer.flush().await.unwrap();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), pending.wait())
            .await
            .unwrap(),
        Err(CallError::ChannelClosed)
    );
    server.closed().await;
    assert!(matches!(
        server.call(1, Message::GetGreeter).await,
        Err(Error::Closed)
    ));
    drop(peer);
}
