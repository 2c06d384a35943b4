use crate::error::{Error, Result};
use crate::protocol::{AuthMethod, MAX_CREDENTIAL_LEN};
use std::fmt;

/// UserPass holds username/password credentials, either the ones a listener
/// demands from its clients or the ones presented to an upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// UserPass implementation block
impl UserPass {
    /// new is a constructor for the UserPass type
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// validate checks both fields fit the one-byte RFC 1929 length prefix
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("username", &self.username), ("password", &self.password)] {
            if value.is_empty() || value.len() > MAX_CREDENTIAL_LEN {
                return Err(Error::config(format!(
                    "{name} must be 1 to {MAX_CREDENTIAL_LEN} bytes, got {}",
                    value.len()
                )));
            }
        }
        Ok(())
    }

    /// matches compares presented credentials byte-for-byte
    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }
}

// Keep the password out of logs
impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// select_auth_method takes the auth methods offered by a socks client and
/// returns the method the listener will use. A listener that requires auth
/// only accepts username/password; otherwise no-auth is preferred
pub fn select_auth_method(client_methods: &[u8], require_auth: bool) -> AuthMethod {
    // Preferred auth method order
    let preferred: &[AuthMethod] = if require_auth {
        &[AuthMethod::UserPass]
    } else {
        &[AuthMethod::NoAuth, AuthMethod::UserPass]
    };

    // Iterate through preferences in order. If there's a match
    // return it
    for &method in preferred {
        if client_methods.contains(&(method as u8)) {
            return method;
        }
    }

    AuthMethod::NoAcceptable
}
