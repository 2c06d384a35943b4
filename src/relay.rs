//! Tokio runtime around the session table: a listener that drives server
//! sessions, an optional upstream hop driven by client sessions, and the
//! reaper task.

use crate::auth::UserPass;
use crate::client;
use crate::config::{DEFAULT_CONNECT_TIMEOUT, Endpoint, TargetId};
use crate::error::Error;
use crate::server;
use crate::session::{Handle, Progress, Session};
use crate::table::SessionTable;
use anyhow::{Result, anyhow, bail};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Target of sessions accepted on the listener
pub const LISTENER_TARGET: TargetId = TargetId(0);

/// Target of sessions dialed toward the upstream proxy
pub const UPSTREAM_TARGET: TargetId = TargetId(1);

const READ_BUFFER_SIZE: usize = 4096;

/// Relay is a SOCKS5 listener that either connects to destinations directly
/// or tunnels every CONNECT through an upstream SOCKS5 proxy
pub struct Relay {
    pub listen_addr: String,
    pub auth_config: Option<UserPass>,
    max_connections: u32,
    connect_timeout: Duration,
    upstream: Option<Endpoint>,
    table: Arc<SessionTable>,
    listener: Option<TcpListener>,
    handles: Arc<AtomicU64>,
}

/// Relay implementation block
impl Relay {
    /// new is a constructor for the Relay type
    pub fn new(listen_addr: impl Into<String>, table: Arc<SessionTable>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            auth_config: None,
            max_connections: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upstream: None,
            table,
            listener: None,
            handles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// with_auth applies the credentials clients must present
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        self.auth_config = auth;
        self
    }

    /// with_max_connections caps concurrent clients, 0 for no limit
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// with_connect_timeout bounds direct connects to destinations
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// with_upstream tunnels CONNECTs through the given SOCKS5 proxy
    pub fn with_upstream(mut self, upstream: Option<Endpoint>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// bind to the listen address and register the listener and upstream
    /// targets with the table
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        let SocketAddr::V4(local) = addr else {
            bail!("[ERR] listener must be an IPv4 address, got {addr}");
        };

        let endpoint = Endpoint::new(local)
            .with_auth(self.auth_config.clone())
            .with_max_connections(self.max_connections)
            .with_connect_timeout(self.connect_timeout);
        self.table
            .enable_target(LISTENER_TARGET, Some(Arc::new(endpoint)))?;

        if let Some(upstream) = &self.upstream {
            self.table
                .enable_target(UPSTREAM_TARGET, Some(Arc::new(upstream.clone())))?;
            info!("tunnelling through upstream {}", upstream.addr);
        }

        info!("SOCKS5 relay listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts clients until the listener fails, with the reaper
    /// sweeping in the background
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener is not bound"))?;

        let reaper = spawn_reaper(
            Arc::clone(&self.table),
            self.table.config().reap_interval,
        );
        let upstream = self.upstream.as_ref().map(|_| UPSTREAM_TARGET);

        // Listen for connections to relay
        loop {
            let (inbound, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    reaper.abort();
                    return Err(e.into());
                }
            };

            // Clone for this connection
            let table = Arc::clone(&self.table);
            let handles = Arc::clone(&self.handles);

            tokio::spawn(async move {
                info!("new client: {}", peer_addr);

                if let Err(e) = handle_connection(table, handles, upstream, inbound).await {
                    error!("connection error: {}", e);
                }
            });
        }
    }
}

/// spawn_reaper sweeps the table every period until aborted
pub fn spawn_reaper(table: Arc<SessionTable>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));

        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reaped = table.reap();
            debug!("reaper sweep: {} sessions evicted, {} live", reaped.len(), table.len());
        }
    })
}

fn next_handle(handles: &AtomicU64) -> Handle {
    Handle(handles.fetch_add(1, Ordering::Relaxed))
}

fn reaped(handle: Handle) -> anyhow::Error {
    anyhow!("[ERR] session on {handle} was reaped")
}

/// handle_connection runs one inbound client from greeting to teardown
async fn handle_connection(
    table: Arc<SessionTable>,
    handles: Arc<AtomicU64>,
    upstream: Option<TargetId>,
    mut inbound: TcpStream,
) -> Result<()> {
    let id = table.accept(LISTENER_TARGET)?;
    let handle = next_handle(&handles);
    if let Err(e) = table.register_inbound(id, handle) {
        let _ = table.delete(id);
        return Err(e.into());
    }

    let result = serve(&table, &handles, upstream, &mut inbound, handle).await;

    // Failed sessions stay visible until the reaper takes them
    table.release_inbound(handle);

    result
}

async fn serve(
    table: &SessionTable,
    handles: &AtomicU64,
    upstream: Option<TargetId>,
    inbound: &mut TcpStream,
    handle: Handle,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    // Handshake
    let payload = loop {
        let n = inbound.read(&mut buf).await?;
        if n == 0 {
            table.with_inbound(handle, Session::end_of_stream).transpose()?;
            bail!("[ERR] client closed the connection during the handshake");
        }

        if let Some(payload) = drive_inbound(table, handle, &buf[..n], inbound).await? {
            break payload;
        }
    };

    let (destination, connect_timeout) = table
        .with_inbound(handle, |session| {
            (session.destination(), session.endpoint().connect_timeout)
        })
        .ok_or_else(|| reaped(handle))?;

    let mut tracked = Tracked {
        inbound: handle,
        tunnel: None,
    };

    let (mut outbound, early) = match upstream {
        Some(target) => {
            let tunnel = next_handle(handles);
            let (stream, early) = dial_upstream(table, target, destination, tunnel).await?;
            tracked.tunnel = Some(tunnel);
            (stream, early)
        }
        None => {
            let stream = timeout(connect_timeout, TcpStream::connect(destination))
                .await
                .map_err(|_| anyhow!("[ERR] connect to {destination} timed out"))??;
            (stream, Vec::new())
        }
    };

    let result = relay_payload(table, tracked, inbound, &mut outbound, &payload, &early).await;

    if let Some(tunnel) = tracked.tunnel {
        table.release_outbound(tunnel);
    }

    result
}

/// drive_inbound feeds client bytes to the server state machine, writing each
/// reply as it is produced. Returns the trailing payload once established
async fn drive_inbound(
    table: &SessionTable,
    handle: Handle,
    data: &[u8],
    inbound: &mut TcpStream,
) -> Result<Option<Vec<u8>>> {
    let mut input = data;

    loop {
        let progress = table
            .with_inbound(handle, |session| {
                server::drive(session, input, table.server_counters())
            })
            .ok_or_else(|| reaped(handle))?;
        input = &[];

        // Refusals carry a reply too, so write before looking at the result
        let reply = table
            .with_inbound(handle, Session::take_transmit)
            .unwrap_or_default();
        if !reply.is_empty() {
            inbound.write_all(&reply).await?;
        }

        match progress? {
            Progress::Transmit => {
                let buffered = table
                    .with_inbound(handle, |session| session.has_pending_receive())
                    .unwrap_or(false);
                if !buffered {
                    return Ok(None);
                }
            }
            Progress::NeedMore { .. } => return Ok(None),
            Progress::Established { payload } => return Ok(Some(payload)),
            Progress::Payload(_) => bail!("[ERR] session on {handle} is already established"),
        }
    }
}

/// dial_upstream opens a tunnel to destination through target's SOCKS5
/// endpoint, tracked by a client session bound to the outbound handle.
/// Returns the stream and any bytes the upstream sent after its reply. A
/// tunnel refused by the upstream is left in ERROR for the reaper
pub async fn dial_upstream(
    table: &SessionTable,
    target: TargetId,
    destination: SocketAddrV4,
    handle: Handle,
) -> Result<(TcpStream, Vec<u8>)> {
    let id = table.create(destination, target)?;
    if let Err(e) = table.register_outbound(id, handle) {
        let _ = table.delete(id);
        return Err(e.into());
    }

    match upstream_handshake(table, handle).await {
        Ok(tunnel) => Ok(tunnel),
        Err(e) => {
            table.release_outbound(handle);
            Err(e)
        }
    }
}

fn drive_tunnel(table: &SessionTable, handle: Handle, input: &[u8]) -> Result<Progress> {
    let progress = table
        .with_outbound(handle, |session| client::drive(session, input))
        .ok_or_else(|| reaped(handle))??;
    Ok(progress)
}

async fn upstream_handshake(table: &SessionTable, handle: Handle) -> Result<(TcpStream, Vec<u8>)> {
    let endpoint = table
        .with_outbound(handle, |session| {
            session.begin_connecting()?;
            Ok::<_, Error>(Arc::clone(session.endpoint()))
        })
        .ok_or_else(|| reaped(handle))??;

    let mut stream = timeout(endpoint.connect_timeout, TcpStream::connect(endpoint.addr))
        .await
        .map_err(|_| anyhow!("[ERR] upstream {} timed out", endpoint.addr))??;
    debug!(%handle, upstream = %endpoint.addr, "upstream connected");

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut progress = drive_tunnel(table, handle, &[])?;

    loop {
        let request = table
            .with_outbound(handle, Session::take_transmit)
            .unwrap_or_default();
        if !request.is_empty() {
            stream.write_all(&request).await?;
        }

        match progress {
            Progress::Established { payload } => return Ok((stream, payload)),
            Progress::Transmit | Progress::NeedMore { .. } => {}
            Progress::Payload(_) => bail!("[ERR] upstream sent payload before the handshake ended"),
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            table.with_outbound(handle, Session::end_of_stream).transpose()?;
            bail!("[ERR] upstream {} closed during the handshake", endpoint.addr);
        }
        progress = drive_tunnel(table, handle, &buf[..n])?;
    }
}

/// Tracked names the sessions of one relayed connection by their handles
#[derive(Debug, Clone, Copy)]
struct Tracked {
    inbound: Handle,
    tunnel: Option<Handle>,
}

#[derive(Debug, Clone, Copy)]
enum Flow {
    ToUpstream,
    ToClient,
}

impl Tracked {
    /// account records n forwarded bytes on every session of the connection,
    /// refreshing their activity. False once the listener session is gone
    fn account(&self, table: &SessionTable, flow: Flow, n: usize) -> bool {
        let record = |session: &mut Session| match flow {
            Flow::ToUpstream => session.forward_to_upstream(n),
            Flow::ToClient => session.forward_to_client(n),
        };

        if let Some(tunnel) = self.tunnel {
            let _ = table.with_outbound(tunnel, record);
        }
        table.with_inbound(self.inbound, record).is_some()
    }

    fn is_live(&self, table: &SessionTable) -> bool {
        table.with_inbound(self.inbound, |_| ()).is_some()
    }
}

/// relay_payload copies bytes both ways until both sides close, accounting
/// for every chunk as it passes
async fn relay_payload(
    table: &SessionTable,
    tracked: Tracked,
    inbound: &mut TcpStream,
    outbound: &mut TcpStream,
    payload: &[u8],
    early: &[u8],
) -> Result<()> {
    // Bytes that arrived alongside the last handshake message
    if !payload.is_empty() {
        outbound.write_all(payload).await?;
        tracked.account(table, Flow::ToUpstream, payload.len());
    }
    if !early.is_empty() {
        inbound.write_all(early).await?;
        tracked.account(table, Flow::ToClient, early.len());
    }

    let (client_reader, client_writer) = inbound.split();
    let (server_reader, server_writer) = outbound.split();

    let (from_client, from_server) = tokio::try_join!(
        pump(table, tracked, Flow::ToUpstream, client_reader, server_writer),
        pump(table, tracked, Flow::ToClient, server_reader, client_writer),
    )?;

    info!(
        "connection closed: {} bytes from client, {} bytes from server",
        payload.len() as u64 + from_client,
        early.len() as u64 + from_server
    );
    Ok(())
}

/// pump copies one direction until its reader closes. Reads wait at most a
/// reap interval so an evicted session is noticed even with no traffic
async fn pump<R, W>(
    table: &SessionTable,
    tracked: Tracked,
    flow: Flow,
    mut reader: R,
    mut writer: W,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let wait = table.config().reap_interval;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(wait, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) if tracked.is_live(table) => continue,
            Err(_) => return Err(reaped(tracked.inbound)),
        };

        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        total += n as u64;

        if !tracked.account(table, flow, n) {
            return Err(reaped(tracked.inbound));
        }
    }
}
