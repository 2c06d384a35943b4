//! Server side of the handshake, spoken to clients that dialed a listener.
//!
//! Every reply the server decides on, including the refusals, is left in
//! the session's transmit buffer; callers write it out before acting on an
//! error so the client learns why it was turned away.

use crate::auth::select_auth_method;
use crate::codec::{
    CodecError, ConnectRequest, ConnectResponse, Decoded, Greeting, MethodSelection,
    UserPassRequest, UserPassResponse,
};
use crate::error::{Error, Result};
use crate::protocol::{AuthMethod, AuthStatus, ReplyCode};
use crate::session::{Progress, Session, SessionState};
use crate::stats::ServerStats;
use tracing::{debug, info};

/// drive feeds bytes read from an inbound client into the session and
/// advances the handshake by at most one message. When bytes remain buffered
/// after a [`Progress::Transmit`], call again with empty input
pub fn drive(session: &mut Session, input: &[u8], stats: &ServerStats) -> Result<Progress> {
    let state = session.state();
    if state.is_terminal() {
        return Err(Error::UnexpectedInput(state));
    }
    session.receive(input);

    match state {
        SessionState::Greeting => on_greeting(session, stats),
        SessionState::Auth => on_auth(session, stats),
        SessionState::Request => on_request(session),
        SessionState::Established => Ok(Progress::Payload(session.take_receive())),
        _ => Err(session.fail(Error::UnexpectedInput(state))),
    }
}

fn on_greeting(session: &mut Session, stats: &ServerStats) -> Result<Progress> {
    let greeting = match session.decode_next(Greeting::decode)? {
        Decoded::Complete { message, .. } => message,
        Decoded::Incomplete { needed } => return Ok(Progress::NeedMore { needed }),
    };

    let method = select_auth_method(&greeting.methods, session.endpoint().requires_auth());
    session.transmit(|buf| {
        MethodSelection {
            method: method as u8,
        }
        .encode(buf);
        Ok(())
    })?;

    debug!(session = %session.id(), offered = ?greeting.methods, selected = ?method, "greeting");

    match method {
        AuthMethod::NoAcceptable => {
            stats.record_rejected();
            Err(session.fail(Error::NoAcceptableMethod))
        }
        AuthMethod::UserPass => {
            stats.record_accepted();
            session.advance(SessionState::Auth)?;
            Ok(Progress::Transmit)
        }
        AuthMethod::NoAuth => {
            stats.record_accepted();
            session.advance(SessionState::Request)?;
            Ok(Progress::Transmit)
        }
    }
}

fn on_auth(session: &mut Session, stats: &ServerStats) -> Result<Progress> {
    let request = match session.decode_next(UserPassRequest::decode)? {
        Decoded::Complete { message, .. } => message,
        Decoded::Incomplete { needed } => return Ok(Progress::NeedMore { needed }),
    };

    // A listener without credentials has nothing to accept
    let authenticated = session
        .endpoint()
        .auth
        .as_ref()
        .is_some_and(|creds| creds.matches(&request.username, &request.password));

    let status = if authenticated {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };
    session.transmit(|buf| {
        UserPassResponse {
            status: status as u8,
        }
        .encode(buf);
        Ok(())
    })?;

    if !authenticated {
        stats.record_auth_failure();
        return Err(session.fail(Error::Authentication));
    }

    debug!(session = %session.id(), "client authenticated");
    session.advance(SessionState::Request)?;
    Ok(Progress::Transmit)
}

fn on_request(session: &mut Session) -> Result<Progress> {
    let request = match ConnectRequest::decode(session.pending_receive()) {
        Ok(Decoded::Complete { message, consumed }) => {
            session.consume_receive(consumed);
            message
        }
        Ok(Decoded::Incomplete { needed }) => return Ok(Progress::NeedMore { needed }),
        // These get a reply before the session is torn down
        Err(e @ (CodecError::CommandNotSupported(_) | CodecError::AddressTypeNotSupported(_))) => {
            let response = ConnectResponse::new(e.reply_code());
            session.transmit(|buf| response.encode(buf))?;
            return Err(session.fail(e.into()));
        }
        Err(e) => return Err(session.fail(e.into())),
    };

    let Some(destination) = request.destination.as_ipv4() else {
        let atyp = request.destination.address_type() as u8;
        return Err(session.fail(CodecError::AddressTypeNotSupported(atyp).into()));
    };
    session.set_destination(destination);

    let response = ConnectResponse::new(ReplyCode::Succeeded);
    session.transmit(|buf| response.encode(buf))?;
    session.establish()?;

    info!(session = %session.id(), %destination, "connect request accepted");
    Ok(Progress::Established {
        payload: session.take_receive(),
    })
}
