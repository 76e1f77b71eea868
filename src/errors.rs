// Error taxonomy for the liquidity-provision engine.
//
// Workers catch EngineError at the top of each iteration and continue on the
// next tick; only Config, Keystore and Invariant terminate the process (after
// a state snapshot). Transient network failures are retried inside the
// backend wrapper with exponential backoff before they surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal at startup: unparseable or inconsistent configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Fatal at startup: wallet keypair missing or unreadable.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// Network blip, rate limit, socket reset, timeout. Retried with
    /// backoff; surfaces only after the retry budget is exhausted.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// 4xx responses and malformed bodies. Never retried.
    #[error("permanent network failure: {0}")]
    NetworkPermanent(String),

    /// Transaction submitted but failed on chain. Signatures and program
    /// logs are preserved for the operator.
    #[error("backend execution failed: {message}")]
    BackendExec {
        message: String,
        signatures: Vec<String>,
    },

    /// Pool failed a safety layer. Recorded as a rejection reason, not a
    /// worker failure.
    #[error("validation failure: {0}")]
    Validation(String),

    /// A state invariant was broken (e.g. duplicate open position for one
    /// pool). Fatal: state is persisted and the process exits non-zero.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Pool directory fetch failed and no cached listing exists.
    #[error("pool listing fetch failed: {0}")]
    Fetch(String),

    /// State snapshot / trade-log write failure.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::NetworkTransient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_) | EngineError::Keystore(_) | EngineError::Invariant(_)
        )
    }
}

/// Maps a reqwest failure onto the transient/permanent split. Connection
/// problems and 429/5xx are retryable; other HTTP statuses and decode
/// failures are not.
pub fn classify_http(err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() {
        return EngineError::NetworkTransient(err.to_string());
    }
    if let Some(status) = err.status() {
        if status.as_u16() == 429 || status.is_server_error() {
            return EngineError::NetworkTransient(format!("HTTP {}: {}", status, err));
        }
        return EngineError::NetworkPermanent(format!("HTTP {}: {}", status, err));
    }
    if err.is_decode() {
        return EngineError::NetworkPermanent(format!("malformed response: {}", err));
    }
    EngineError::NetworkTransient(err.to_string())
}

/// Maps an explicit HTTP status (checked before JSON decode) the same way.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
    if status.as_u16() == 429 || status.is_server_error() {
        EngineError::NetworkTransient(format!("HTTP {}: {}", status, body))
    } else {
        EngineError::NetworkPermanent(format!("HTTP {}: {}", status, body))
    }
}

/// Solana RPC client failures: transport problems retry, RPC-level
/// rejections do not.
pub fn classify_rpc(err: solana_client::client_error::ClientError) -> EngineError {
    use solana_client::client_error::ClientErrorKind;
    match err.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => {
            EngineError::NetworkTransient(err.to_string())
        }
        _ => EngineError::NetworkPermanent(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::NetworkTransient("reset".into()).is_transient());
        assert!(!EngineError::NetworkPermanent("404".into()).is_transient());
        assert!(!EngineError::Validation("burn too low".into()).is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(EngineError::Config("bad".into()).is_fatal());
        assert!(EngineError::Invariant("dup".into()).is_fatal());
        assert!(!EngineError::NetworkTransient("blip".into()).is_fatal());
        assert!(!EngineError::BackendExec {
            message: "tx failed".into(),
            signatures: vec![]
        }
        .is_fatal());
    }
}
