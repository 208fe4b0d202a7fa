//! Error taxonomy for the directory client.

use crate::connection::ConnectionState;
use crate::ldap_protocol::ResultCode;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LdapError>;

#[derive(Debug, Error)]
pub enum LdapError {
    #[error("connection to {addr} refused")]
    ConnectionRefused { addr: String },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("could not resolve host {host}")]
    UnresolvedHost { host: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed frame: bad tag, truncated length, invalid field encoding.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {code} ({diagnostic})")]
    AuthenticationFailed { code: ResultCode, diagnostic: String },

    #[error("operation failed: {code} matched={matched_dn:?} ({diagnostic})")]
    Operation {
        code: ResultCode,
        matched_dn: String,
        diagnostic: String,
    },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("search result stream exhausted")]
    StreamExhausted,

    #[error("invalid connection state: {actual} (expected {expected})")]
    InvalidState {
        expected: &'static str,
        actual: ConnectionState,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid search filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("no free message IDs")]
    IdsExhausted,

    #[error("{0} requests still outstanding")]
    OutstandingRequests(usize),

    #[error("cannot encode {0}")]
    Unsupported(&'static str),
}

impl LdapError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        LdapError::Protocol(msg.into())
    }

    pub(crate) fn connection_lost(reason: impl Into<String>) -> Self {
        LdapError::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// True for failures after which the connection is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LdapError::ConnectionLost { .. } | LdapError::Protocol(_) | LdapError::Timeout(_)
        )
    }
}
