//! Client side of the handshake, spoken toward an upstream SOCKS5 endpoint.
//!
//! The caller opens the transport, calls [`send_greeting`], writes whatever
//! the session has pending, and then feeds every byte read from the upstream
//! to [`drive`] until it reports [`Progress::Established`].

use crate::codec::{
    ConnectRequest, ConnectResponse, Decoded, Greeting, MethodSelection, UserPassRequest,
    UserPassResponse,
};
use crate::config::ProxyProtocol;
use crate::error::{Error, Result};
use crate::protocol::{AuthMethod, AuthStatus, ReplyCode};
use crate::session::{Progress, Session, SessionState};
use tracing::debug;

/// send_greeting queues the greeting for the session's endpoint. Returns
/// false when it was already sent
pub fn send_greeting(session: &mut Session) -> Result<bool> {
    if session.greeting_sent {
        return Ok(false);
    }

    let endpoint = session.endpoint().clone();
    if endpoint.protocol != ProxyProtocol::Socks5 {
        return Err(Error::UnsupportedProtocol(endpoint.protocol));
    }

    session.advance(SessionState::Greeting)?;
    let greeting = Greeting::for_credentials(endpoint.auth.is_some());
    if let Err(e) = session.transmit(|buf| greeting.encode(buf)) {
        return Err(session.fail(e.into()));
    }

    session.greeting_sent = true;
    Ok(true)
}

/// send_auth queues the username/password request. Returns false when it was
/// already sent
pub fn send_auth(session: &mut Session) -> Result<bool> {
    if session.auth_sent {
        return Ok(false);
    }

    let Some(credentials) = session.endpoint().auth.clone() else {
        return Err(session.fail(Error::UnexpectedMethod(AuthMethod::UserPass as u8)));
    };

    session.advance(SessionState::Auth)?;
    let request = UserPassRequest {
        username: credentials.username.into_bytes(),
        password: credentials.password.into_bytes(),
    };
    if let Err(e) = session.transmit(|buf| request.encode(buf)) {
        return Err(session.fail(e.into()));
    }

    session.auth_sent = true;
    Ok(true)
}

/// send_connect queues the CONNECT request for the session's destination.
/// Returns false when it was already sent
pub fn send_connect(session: &mut Session) -> Result<bool> {
    if session.request_sent {
        return Ok(false);
    }

    session.advance(SessionState::Request)?;
    let request = ConnectRequest {
        destination: session.destination().into(),
    };
    if let Err(e) = session.transmit(|buf| request.encode(buf)) {
        return Err(session.fail(e.into()));
    }

    session.request_sent = true;
    Ok(true)
}

/// drive feeds bytes read from the upstream into the session and advances
/// the handshake as far as they allow
pub fn drive(session: &mut Session, input: &[u8]) -> Result<Progress> {
    let state = session.state();
    if state.is_terminal() {
        return Err(Error::UnexpectedInput(state));
    }

    match state {
        // Nothing is expected before the greeting goes out
        SessionState::Idle | SessionState::Connecting if input.is_empty() => {
            send_greeting(session)?;
            Ok(Progress::Transmit)
        }
        SessionState::Idle | SessionState::Connecting => {
            session.receive(input);
            Err(session.fail(Error::UnexpectedInput(state)))
        }
        SessionState::Greeting => {
            session.receive(input);
            on_method_selection(session)
        }
        SessionState::Auth => {
            session.receive(input);
            on_auth_response(session)
        }
        SessionState::Request | SessionState::Response => {
            session.receive(input);
            on_connect_response(session)
        }
        SessionState::Established => {
            session.receive(input);
            Ok(Progress::Payload(session.take_receive()))
        }
        SessionState::Error | SessionState::Closed => Err(Error::UnexpectedInput(state)),
    }
}

fn on_method_selection(session: &mut Session) -> Result<Progress> {
    let selection = match session.decode_next(MethodSelection::decode)? {
        Decoded::Complete { message, .. } => message,
        Decoded::Incomplete { needed } => return Ok(Progress::NeedMore { needed }),
    };

    debug!(session = %session.id(), method = selection.method, "upstream selected method");

    match AuthMethod::from_byte(selection.method) {
        Some(AuthMethod::NoAuth) => {
            send_connect(session)?;
            Ok(Progress::Transmit)
        }
        Some(AuthMethod::UserPass) if session.endpoint().auth.is_some() => {
            send_auth(session)?;
            Ok(Progress::Transmit)
        }
        Some(AuthMethod::NoAcceptable) => Err(session.fail(Error::NoAcceptableMethod)),
        _ => Err(session.fail(Error::UnexpectedMethod(selection.method))),
    }
}

fn on_auth_response(session: &mut Session) -> Result<Progress> {
    let response = match session.decode_next(UserPassResponse::decode)? {
        Decoded::Complete { message, .. } => message,
        Decoded::Incomplete { needed } => return Ok(Progress::NeedMore { needed }),
    };

    if response.status != AuthStatus::Success as u8 {
        return Err(session.fail(Error::Authentication));
    }

    send_connect(session)?;
    Ok(Progress::Transmit)
}

fn on_connect_response(session: &mut Session) -> Result<Progress> {
    // A refusal is acted on as soon as REP is visible
    let header = match ConnectResponse::decode_header(session.pending_receive()) {
        Ok(header) => header,
        Err(e) => return Err(session.fail(e.into())),
    };
    if let Some(reply) = header.filter(|reply| *reply != ReplyCode::Succeeded as u8) {
        return Err(session.fail(Error::ConnectRejected(reply)));
    }

    match session.decode_next(ConnectResponse::decode)? {
        Decoded::Complete { message, .. } => {
            session.establish()?;
            debug!(session = %session.id(), bound = %message.bound, "upstream connect succeeded");
            Ok(Progress::Established {
                payload: session.take_receive(),
            })
        }
        Decoded::Incomplete { needed } => {
            if header.is_some() && session.state() == SessionState::Request {
                session.advance(SessionState::Response)?;
            }
            Ok(Progress::NeedMore { needed })
        }
    }
}
