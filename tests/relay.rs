use socks_relay::{
    Endpoint, Handle, Relay, RelayConfig, SessionState, SessionTable,
    auth::UserPass,
    relay::{LISTENER_TARGET, UPSTREAM_TARGET, dial_upstream},
};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

async fn start_echo() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
        panic!("expected an IPv4 listener");
    };

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn start_relay(
    auth: Option<UserPass>,
    upstream: Option<Endpoint>,
) -> (SocketAddrV4, Arc<SessionTable>) {
    start_relay_with(RelayConfig::default(), |relay| {
        relay.with_auth(auth).with_upstream(upstream)
    })
    .await
}

async fn start_relay_with(
    config: RelayConfig,
    build: impl FnOnce(Relay) -> Relay,
) -> (SocketAddrV4, Arc<SessionTable>) {
    let table = Arc::new(SessionTable::new(config).unwrap());
    let mut relay = build(Relay::new("127.0.0.1:0", Arc::clone(&table)));

    let SocketAddr::V4(addr) = relay.bind().await.unwrap() else {
        panic!("expected an IPv4 listener");
    };
    tokio::spawn(async move { relay.run().await });

    (addr, table)
}

fn connect_request(destination: SocketAddrV4) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&destination.ip().octets());
    request.extend_from_slice(&destination.port().to_be_bytes());
    request
}

fn userpass(username: &str, password: &str) -> Vec<u8> {
    let mut request = vec![0x01, username.len() as u8];
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    request
}

async fn read_exact<const N: usize>(stream: &mut TcpStream) -> [u8; N] {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

async fn assert_echo(stream: &mut TcpStream) {
    stream.write_all(b"ping").await.unwrap();
    assert_eq!(&read_exact::<4>(stream).await, b"ping");
}

#[tokio::test]
async fn test_no_auth_connect() {
    let echo = start_echo().await;
    let (relay, table) = start_relay(None, None).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x00]);

    client.write_all(&connect_request(echo)).await.unwrap();
    let reply = read_exact::<10>(&mut client).await;
    assert_eq!(reply[..2], [0x05, 0x00]);

    assert_echo(&mut client).await;
    assert_eq!(table.server_stats().connections_accepted, 1);
}

#[tokio::test]
async fn test_pipelined_handshake_and_payload() {
    let echo = start_echo().await;
    let (relay, _table) = start_relay(None, None).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    let mut hello = vec![0x05, 0x01, 0x00];
    hello.extend_from_slice(&connect_request(echo));
    hello.extend_from_slice(b"early");
    client.write_all(&hello).await.unwrap();

    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x00]);
    assert_eq!(read_exact::<10>(&mut client).await[1], 0x00);
    assert_eq!(&read_exact::<5>(&mut client).await, b"early");
}

#[tokio::test]
async fn test_userpass_auth() {
    let echo = start_echo().await;
    let (relay, table) = start_relay(Some(UserPass::new("alice", "wonder")), None).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x02]);

    client.write_all(&userpass("alice", "wonder")).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x01, 0x00]);

    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_exact::<10>(&mut client).await[1], 0x00);

    assert_echo(&mut client).await;
    assert_eq!(table.server_stats().auth_failures, 0);
}

#[tokio::test]
async fn test_wrong_password_is_refused() {
    let (relay, table) = start_relay(Some(UserPass::new("alice", "wonder")), None).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x02]);

    client.write_all(&userpass("alice", "nope")).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x01, 0x01]);

    // The relay hangs up after refusing
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(table.server_stats().auth_failures, 1);

    // The refused session is kept until the reaper runs
    assert_eq!(table.len(), 1);
    assert_eq!(table.reap().len(), 1);
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_domain_connect_is_refused() {
    let (relay, _table) = start_relay(None, None).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let reply = read_exact::<10>(&mut client).await;
    assert_eq!(reply[..2], [0x05, 0x08]);
}

#[tokio::test]
async fn test_chained_through_upstream() {
    let echo = start_echo().await;
    let (upstream, upstream_table) =
        start_relay(Some(UserPass::new("alice", "wonder")), None).await;
    let upstream_endpoint =
        Endpoint::new(upstream).with_auth(Some(UserPass::new("alice", "wonder")));
    let (relay, _table) = start_relay(None, Some(upstream_endpoint)).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x00]);

    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_exact::<10>(&mut client).await[1], 0x00);

    assert_echo(&mut client).await;
    assert_eq!(upstream_table.server_stats().connections_accepted, 1);
    assert_eq!(upstream_table.server_stats().auth_failures, 0);
}

#[tokio::test]
async fn test_dial_upstream_with_bad_credentials() {
    let echo = start_echo().await;
    let (upstream, upstream_table) =
        start_relay(Some(UserPass::new("alice", "wonder")), None).await;

    let table = SessionTable::new(RelayConfig::default()).unwrap();
    let endpoint = Endpoint::new(upstream).with_auth(Some(UserPass::new("alice", "guess")));
    table
        .enable_target(UPSTREAM_TARGET, Some(Arc::new(endpoint)))
        .unwrap();

    let handle = Handle(1);
    assert!(dial_upstream(&table, UPSTREAM_TARGET, echo, handle).await.is_err());
    assert_eq!(upstream_table.server_stats().auth_failures, 1);

    // The refused tunnel stays visible, still counted, until reaped
    let id = table.lookup_by_outbound(handle).unwrap();
    assert_eq!(table.with_session(id, |s| s.state()), Some(SessionState::Error));
    assert_eq!(table.target_stats(UPSTREAM_TARGET).active_connections, 1);

    assert_eq!(table.reap(), vec![id]);
    assert!(table.is_empty());
    let stats = table.target_stats(UPSTREAM_TARGET);
    assert_eq!((stats.total_connections, stats.active_connections), (1, 0));
}

#[tokio::test]
async fn test_busy_tunnel_outlives_session_timeout() {
    let echo = start_echo().await;
    let config = RelayConfig {
        session_timeout: Duration::from_millis(300),
        reap_interval: Duration::from_millis(50),
        ..RelayConfig::default()
    };
    let (relay, table) = start_relay_with(config, |relay| relay.with_max_connections(1)).await;

    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exact::<2>(&mut client).await, [0x05, 0x00]);
    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_exact::<10>(&mut client).await[1], 0x00);

    // Keep traffic flowing for over three timeouts
    for _ in 0..10 {
        assert_echo(&mut client).await;
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(table.len(), 1);
    let stats = table.target_stats(LISTENER_TARGET);
    assert_eq!(stats.active_connections, 1);

    // The limit still holds while the tunnel is busy
    let mut second = TcpStream::connect(relay).await.unwrap();
    let mut buf = [0u8; 2];
    let n = timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(table.target_stats(LISTENER_TARGET).connection_failures, 1);

    // Once traffic stops the tunnel is reaped and the client is hung up on
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(table.is_empty());

    let stats = table.target_stats(LISTENER_TARGET);
    assert_eq!(stats.active_connections, 0);
    assert_eq!((stats.bytes_sent, stats.bytes_received), (40, 40));
}
