//! Dispatch-table behavior of the responder engine, driven with
//! hand-encoded frames from the client role.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use tunnelmux_core::{Config, EngineError, Tunnel};
use tunnelmux_proto::{Message, MessageKind, CONTROL_CHANNEL};
use tunnelmux_stream::memory::{self, MemoryStream};
use tunnelmux_stream::TunnelStream;

fn init_tracing() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

fn config(max_connections: usize) -> Config {
    Config::builder()
        .secret("s3cr3t")
        .timeout(Duration::from_secs(2))
        .control_ping(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(2))
        .max_connections(max_connections)
        .build()
        .unwrap()
}

/// Log a hand-rolled client in against a responder engine and start the
/// responder's dispatch loop. Returns the client-side stream, the engine
/// and the running dispatch thread.
fn establish(
    max_connections: usize,
) -> (
    MemoryStream,
    Arc<Tunnel>,
    JoinHandle<Result<(), EngineError>>,
) {
    let (ours, theirs) = memory::duplex();
    ours.set_timeout(Duration::from_secs(2)).unwrap();
    theirs.set_timeout(Duration::from_secs(2)).unwrap();

    let responder =
        thread::spawn(move || Tunnel::new(config(max_connections), Arc::new(ours), None, false));

    let token = BASE64.encode("alice:s3cr3t");
    let mut client: &dyn TunnelStream = &theirs;
    Message::control_with(MessageKind::Login, token.into_bytes())
        .write_to(&mut client, true)
        .unwrap();
    let helo = Message::read_from(&mut client).unwrap();
    assert_eq!(helo.kind(), MessageKind::Helo);

    let tunnel = responder.join().unwrap().unwrap();
    let dispatch = {
        let tunnel = tunnel.clone();
        thread::spawn(move || tunnel.run())
    };

    (theirs, tunnel, dispatch)
}

fn send(client: &MemoryStream, message: Message) {
    let mut stream: &dyn TunnelStream = client;
    let mut message = message;
    message.write_to(&mut stream, true).unwrap();
}

fn recv(client: &MemoryStream) -> Message {
    let mut stream: &dyn TunnelStream = client;
    Message::read_from(&mut stream).unwrap()
}

/// Replies can interleave with keepalives from the engine's timer when a
/// test runs slowly; skip those.
fn recv_reply(client: &MemoryStream) -> Message {
    loop {
        let message = recv(client);
        if message.kind() != MessageKind::Idle {
            return message;
        }
    }
}

#[test]
fn test_ping_on_control_channel_comes_back_as_pong() {
    init_tracing();
    let (client, tunnel, dispatch) = establish(10);

    send(
        &client,
        Message::control_with(MessageKind::Ping, Bytes::from_static(b"timing-token")),
    );

    let reply = recv_reply(&client);
    assert_eq!(reply.kind(), MessageKind::Pong);
    assert_eq!(reply.channel(), CONTROL_CHANNEL);
    assert_eq!(reply.payload(), b"timing-token");

    tunnel.close();
    let _ = dispatch.join().unwrap();
}

#[test]
fn test_traffic_for_unknown_channels_is_answered_with_disconnect() {
    init_tracing();
    let (client, tunnel, dispatch) = establish(10);

    for kind in [
        MessageKind::Ping,
        MessageKind::Data,
        MessageKind::Pause,
        MessageKind::Resume,
    ] {
        let channel = 7;
        send(
            &client,
            Message::new(kind, channel, Bytes::from_static(b"x")).unwrap(),
        );

        let reply = recv_reply(&client);
        assert_eq!(reply.kind(), MessageKind::Disconnect);
        assert_eq!(reply.channel(), channel);
    }

    tunnel.close();
    let _ = dispatch.join().unwrap();
}

#[test]
fn test_control_on_a_data_channel_kills_the_dispatch_loop() {
    init_tracing();
    let (client, _tunnel, dispatch) = establish(10);

    send(
        &client,
        Message::new(MessageKind::Control, 3, Bytes::new()).unwrap(),
    );

    let result = dispatch.join().unwrap();
    assert!(matches!(result, Err(EngineError::ControlOnDataChannel(3))));
}

#[test]
fn test_second_handshake_kills_the_dispatch_loop() {
    init_tracing();
    let (client, _tunnel, dispatch) = establish(10);

    send(&client, Message::control(MessageKind::Helo));

    let result = dispatch.join().unwrap();
    assert!(matches!(result, Err(EngineError::UnexpectedHandshakeMessage)));
}

#[test]
fn test_connect_beyond_capacity_is_answered_with_disconnect() {
    init_tracing();
    let (client, tunnel, dispatch) = establish(1);

    // a target that accepts and then stays quiet, so the first connection
    // keeps its registry slot while we probe the limit
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let target = thread::spawn(move || listener.accept());

    send(
        &client,
        Message::new(
            MessageKind::Connect,
            1,
            Bytes::from(addr.to_string().into_bytes()),
        )
        .unwrap(),
    );
    // keep the accepted socket open so the first connection holds its slot
    let _target_sock = target.join().unwrap().unwrap();

    // the registry is now full; the next request must be refused
    send(
        &client,
        Message::new(
            MessageKind::Connect,
            2,
            Bytes::from(addr.to_string().into_bytes()),
        )
        .unwrap(),
    );

    let reply = recv_reply(&client);
    assert_eq!(reply.kind(), MessageKind::Disconnect);
    assert_eq!(reply.channel(), 2);
    assert_eq!(tunnel.open_connections(), 1);

    tunnel.close();
    let _ = dispatch.join().unwrap();
}

#[test]
fn test_quiet_tunnel_sends_idle_keepalives_inside_the_window() {
    init_tracing();
    let (client, tunnel, dispatch) = establish(10);

    // nothing is sent after the handshake, so the responder's timer enters
    // the quiet window and emits an idle
    let first = recv(&client);
    assert_eq!(first.kind(), MessageKind::Idle);
    assert_eq!(first.channel(), CONTROL_CHANNEL);

    // debounced idles may follow inside the window, then the tunnel goes
    // quiet until the periodic ping would take over
    client.set_timeout(Duration::from_millis(900)).unwrap();
    let mut idles = 1;
    loop {
        let mut stream: &dyn TunnelStream = &client;
        match Message::read_from(&mut stream) {
            Ok(message) => {
                assert_eq!(message.kind(), MessageKind::Idle);
                idles += 1;
                assert!(idles <= 4, "idle keepalives must stay debounced");
            }
            Err(_) => break,
        }
    }

    tunnel.close();
    let _ = dispatch.join().unwrap();
}

#[test]
fn test_idle_is_a_no_op() {
    init_tracing();
    let (client, tunnel, dispatch) = establish(10);

    send(&client, Message::control(MessageKind::Idle));

    // the engine keeps dispatching afterwards
    send(
        &client,
        Message::control_with(MessageKind::Ping, Bytes::from_static(b"still-alive")),
    );
    let reply = recv_reply(&client);
    assert_eq!(reply.kind(), MessageKind::Pong);
    assert_eq!(reply.payload(), b"still-alive");

    tunnel.close();
    let _ = dispatch.join().unwrap();
}
