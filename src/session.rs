//! A single proxy conversation and its protocol state.

use crate::codec::{CodecError, Decoded};
use crate::config::{Endpoint, TargetId};
use crate::error::{Error, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// SessionId is a stable index into the session table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle is an opaque transport connection identifier supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// Handle implementation block
impl Handle {
    /// INVALID is the sentinel for "no connection"
    pub const INVALID: Handle = Handle(u64::MAX);

    /// is_valid is false for the sentinel
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Role is the side of the protocol this node plays in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dial an upstream SOCKS5 endpoint
    Client,
    /// An inbound client dialed us
    Server,
}

/// SessionState is the protocol state of a session. In the client role the
/// handshake states mean "message sent, awaiting reply"; in the server role
/// they mean "awaiting this message"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Greeting,
    Auth,
    Request,
    /// Success reply header seen, bound address still arriving
    Response,
    Established,
    Error,
    Closed,
}

/// SessionState implementation block
impl SessionState {
    /// can_advance_to is the transition table. Any live state may fail or
    /// close; nothing leaves Closed
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Idle, Connecting | Greeting) => true,
            (Connecting, Greeting) => true,
            (Greeting, Auth | Request) => true,
            (Auth, Request) => true,
            (Request, Response | Established) => true,
            (Response, Established) => true,
            _ => false,
        }
    }

    /// is_handshaking is true while protocol messages are still expected
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            SessionState::Greeting
                | SessionState::Auth
                | SessionState::Request
                | SessionState::Response
        )
    }

    /// is_terminal is true for states the reaper always evicts
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Greeting => "socks5-greeting",
            SessionState::Auth => "socks5-auth",
            SessionState::Request => "socks5-request",
            SessionState::Response => "socks5-response",
            SessionState::Established => "established",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress is what a state machine step produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The current message is incomplete; at least `needed` more bytes
    NeedMore { needed: usize },
    /// The transmit buffer holds the next message for the peer
    Transmit,
    /// Handshake finished. The transmit buffer may hold a final reply and
    /// `payload` holds any bytes that followed the last handshake message
    Established { payload: Vec<u8> },
    /// Opaque data received on an established session
    Payload(Vec<u8>),
}

/// Session is one proxy conversation
pub struct Session {
    id: SessionId,
    role: Role,
    target: TargetId,
    inbound: Option<Handle>,
    outbound: Option<Handle>,
    state: SessionState,
    destination: SocketAddrV4,
    endpoint: Arc<Endpoint>,

    tx_buffer: Vec<u8>,
    rx_buffer: Vec<u8>,

    bytes_sent: u64,
    bytes_received: u64,
    error_count: u32,

    created_at: Instant,
    last_activity: Instant,

    pub(crate) greeting_sent: bool,
    pub(crate) auth_sent: bool,
    pub(crate) request_sent: bool,
    is_connected: bool,
}

/// Session implementation block
impl Session {
    /// new builds a session in its initial state: Idle for clients, awaiting
    /// the greeting for servers
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        target: TargetId,
        destination: SocketAddrV4,
        endpoint: Arc<Endpoint>,
        now: Instant,
    ) -> Self {
        let state = match role {
            Role::Client => SessionState::Idle,
            Role::Server => SessionState::Greeting,
        };

        Self {
            id,
            role,
            target,
            inbound: None,
            outbound: None,
            state,
            destination,
            endpoint,
            tx_buffer: Vec::new(),
            rx_buffer: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            error_count: 0,
            created_at: now,
            last_activity: now,
            greeting_sent: false,
            auth_sent: false,
            request_sent: false,
            is_connected: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn destination(&self) -> SocketAddrV4 {
        self.destination
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn inbound(&self) -> Option<Handle> {
        self.inbound
    }

    pub fn outbound(&self) -> Option<Handle> {
        self.outbound
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn set_inbound(&mut self, handle: Option<Handle>) {
        self.inbound = handle;
    }

    pub(crate) fn set_outbound(&mut self, handle: Option<Handle>) {
        self.outbound = handle;
    }

    pub(crate) fn set_destination(&mut self, destination: SocketAddrV4) {
        self.destination = destination;
    }

    /// touch refreshes the last-activity timestamp
    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    /// touch_at sets the last-activity timestamp from the caller's clock
    pub fn touch_at(&mut self, at: Instant) {
        self.last_activity = at;
    }

    /// is_idle reports whether the session saw no activity for longer than
    /// timeout. A zero timeout never expires anything
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        !timeout.is_zero() && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// advance moves to next if the transition table allows it
    pub(crate) fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                session: self.id,
                from: self.state,
                to: next,
            });
        }

        debug!(session = %self.id, from = %self.state, to = %next, "state change");
        self.state = next;
        Ok(())
    }

    /// fail marks the session as errored, counts the error and hands it back
    /// so callers can write `return Err(session.fail(e))`
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        warn!(session = %self.id, state = %self.state, "session failed: {err}");
        self.error_count += 1;
        if self.state != SessionState::Closed {
            self.state = SessionState::Error;
        }
        err
    }

    /// establish marks the handshake as done
    pub(crate) fn establish(&mut self) -> Result<()> {
        self.advance(SessionState::Established)?;
        self.is_connected = true;
        Ok(())
    }

    /// begin_connecting records that the outbound transport is being opened
    pub fn begin_connecting(&mut self) -> Result<()> {
        self.advance(SessionState::Connecting)
    }

    /// close moves the session to Closed; the reaper collects it
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!(session = %self.id, from = %self.state, "session closed");
            self.state = SessionState::Closed;
        }
        self.is_connected = false;
    }

    /// end_of_stream is called when the peer closes its side. Mid-handshake
    /// that is a fatal truncation; afterwards it simply closes the session
    pub fn end_of_stream(&mut self) -> Result<()> {
        if self.state.is_handshaking() {
            let buffered = self.rx_buffer.len();
            return Err(self.fail(Error::Truncated(buffered)));
        }
        self.close();
        Ok(())
    }

    // =========
    // BUFFERS
    // =========

    /// transmit replaces the pending-transmit content with whatever encode
    /// writes. A failed encode leaves the buffer empty
    pub(crate) fn transmit<F>(&mut self, encode: F) -> std::result::Result<(), CodecError>
    where
        F: FnOnce(&mut Vec<u8>) -> std::result::Result<(), CodecError>,
    {
        self.tx_buffer.clear();
        let result = encode(&mut self.tx_buffer);
        if result.is_err() {
            self.tx_buffer.clear();
        }
        result
    }

    /// pending_transmit is the message waiting to be written to the peer
    pub fn pending_transmit(&self) -> &[u8] {
        &self.tx_buffer
    }

    /// clear_transmit marks the pending message as written
    pub fn clear_transmit(&mut self) {
        self.tx_buffer.clear();
    }

    /// take_transmit copies out the pending message and clears it
    pub fn take_transmit(&mut self) -> Vec<u8> {
        let out = self.tx_buffer.clone();
        self.tx_buffer.clear();
        out
    }

    /// receive appends bytes read from the peer
    pub(crate) fn receive(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.rx_buffer.extend_from_slice(data);
            self.touch();
        }
    }

    pub fn pending_receive(&self) -> &[u8] {
        &self.rx_buffer
    }

    pub fn has_pending_receive(&self) -> bool {
        !self.rx_buffer.is_empty()
    }

    /// consume_receive drops n decoded bytes from the front of the buffer
    pub(crate) fn consume_receive(&mut self, n: usize) {
        self.rx_buffer.drain(..n.min(self.rx_buffer.len()));
    }

    /// decode_next runs decode over the receive buffer. A complete message
    /// is consumed from the buffer; a protocol violation fails the session
    pub(crate) fn decode_next<T>(
        &mut self,
        decode: impl FnOnce(&[u8]) -> std::result::Result<Decoded<T>, CodecError>,
    ) -> Result<Decoded<T>> {
        match decode(&self.rx_buffer) {
            Ok(Decoded::Complete { message, consumed }) => {
                self.consume_receive(consumed);
                Ok(Decoded::Complete { message, consumed })
            }
            Ok(incomplete) => Ok(incomplete),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// take_receive hands every buffered byte to the caller
    pub(crate) fn take_receive(&mut self) -> Vec<u8> {
        let out = self.rx_buffer.clone();
        self.rx_buffer.clear();
        out
    }

    // ============
    // FORWARDING
    // ============

    /// forward_to_upstream accounts for len payload bytes sent toward the
    /// destination. Only connected sessions carry payload
    pub fn forward_to_upstream(&mut self, len: usize) -> Result<()> {
        if !self.is_connected {
            return Err(Error::NotConnected);
        }
        self.bytes_sent += len as u64;
        self.touch();
        Ok(())
    }

    /// forward_to_client accounts for len payload bytes sent back to the client
    pub fn forward_to_client(&mut self, len: usize) -> Result<()> {
        self.bytes_received += len as u64;
        self.touch();
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] dst={} state={}",
            self.id, self.destination, self.state
        )?;

        if self.is_connected {
            f.write_str(" connected")?;
        }

        write!(
            f,
            " tx={} rx={} errors={}",
            self.bytes_sent, self.bytes_received, self.error_count
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("destination", &self.destination)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

/// UNSPECIFIED_DESTINATION is the destination of a server session before its
/// CONNECT request arrives
pub(crate) const UNSPECIFIED_DESTINATION: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
