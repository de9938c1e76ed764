use thiserror::Error;

use crate::connection::ConnectionState;

/// Failure taxonomy for the client core. `AuthRejected`, `ReconnectExhausted`
/// and `RenewalFailed` require explicit user action (re-login or manual
/// retry); everything else is either retried internally or reported to the
/// immediate caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no access credential stored; log in before connecting")]
    NoCredential,
    #[error("no refresh credential stored; a fresh login is required")]
    AuthExpired,
    #[error("server rejected the access credential on the realtime channel")]
    AuthRejected,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("credential renewal failed: {0}")]
    RenewalFailed(String),
    #[error("session terminated; stored credentials were cleared")]
    SessionTerminated,
    #[error("cannot send while the connection is {state:?}")]
    NotConnected { state: ConnectionState },
    #[error(transparent)]
    Api(#[from] shared::error::ApiRejection),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("credential storage failed: {0}")]
    Storage(#[from] std::io::Error),
}
