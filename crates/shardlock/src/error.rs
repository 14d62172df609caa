//! Error taxonomy shared by the shard, master, and client.
//!
//! `LockError` values are produced inside `apply` and travel inside the
//! response's `errMessage`, so every replica reports the same error for the
//! same entry. The wire form is a stable code, optionally followed by
//! `: <detail>`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock does not exist")]
    LockNotFound,
    #[error("lock is held")]
    LockHeld,
    #[error("lock is not held")]
    LockNotHeld,
    #[error("lock is held by another client")]
    WrongHolder,
    #[error("domain already exists")]
    DomainExists,
    #[error("parent domain does not exist")]
    ParentDomainMissing,
    #[error("invalid domain path")]
    InvalidDomain,
    #[error("lock already exists")]
    LockExists,
    #[error("cannot locate lock")]
    CannotLocateLock,
    #[error("no session for shard")]
    NoSessionForShard,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LockError {
    pub fn code(&self) -> &'static str {
        match self {
            LockError::LockNotFound => "LockNotFound",
            LockError::LockHeld => "LockHeld",
            LockError::LockNotHeld => "LockNotHeld",
            LockError::WrongHolder => "WrongHolder",
            LockError::DomainExists => "DomainExists",
            LockError::ParentDomainMissing => "ParentDomainMissing",
            LockError::InvalidDomain => "InvalidDomain",
            LockError::LockExists => "LockExists",
            LockError::CannotLocateLock => "CannotLocateLock",
            LockError::NoSessionForShard => "NoSessionForShard",
            LockError::InvalidRequest(_) => "InvalidRequest",
        }
    }

    /// Render for the response `errMessage` field.
    pub fn to_wire(&self) -> String {
        match self {
            LockError::InvalidRequest(detail) if !detail.is_empty() => {
                format!("{}: {detail}", self.code())
            }
            other => other.code().to_string(),
        }
    }

    /// Parse an `errMessage`; `None` for an empty message (success).
    ///
    /// Unknown codes are kept as `InvalidRequest` so a newer server cannot
    /// make an older client misreport success.
    pub fn from_wire(message: &str) -> Option<LockError> {
        if message.is_empty() {
            return None;
        }
        let (code, detail) = match message.split_once(": ") {
            Some((code, detail)) => (code, detail),
            None => (message, ""),
        };
        let err = match code {
            "LockNotFound" => LockError::LockNotFound,
            "LockHeld" => LockError::LockHeld,
            "LockNotHeld" => LockError::LockNotHeld,
            "WrongHolder" => LockError::WrongHolder,
            "DomainExists" => LockError::DomainExists,
            "ParentDomainMissing" => LockError::ParentDomainMissing,
            "InvalidDomain" => LockError::InvalidDomain,
            "LockExists" => LockError::LockExists,
            "CannotLocateLock" => LockError::CannotLocateLock,
            "NoSessionForShard" => LockError::NoSessionForShard,
            "InvalidRequest" => LockError::InvalidRequest(detail.to_string()),
            _ => LockError::InvalidRequest(format!("unrecognized error: {message}")),
        };
        Some(err)
    }
}

/// Error returned by `LockClient` calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Deterministic lock/domain logic error reported by a state machine.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Substrate failure: no leader, timeout, unreachable group.
    #[error("transport: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl ClientError {
    pub fn lock_error(&self) -> Option<&LockError> {
        match self {
            ClientError::Lock(err) => Some(err),
            ClientError::Transport(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_keeps_detail() {
        let err = LockError::InvalidRequest("missing field lock".to_string());
        assert_eq!(err.to_wire(), "InvalidRequest: missing field lock");
        assert_eq!(LockError::from_wire(&err.to_wire()), Some(err));
        assert_eq!(
            LockError::from_wire("LockHeld"),
            Some(LockError::LockHeld)
        );
    }

    #[test]
    fn empty_message_is_success() {
        assert_eq!(LockError::from_wire(""), None);
    }

    #[test]
    fn unknown_code_is_not_success() {
        match LockError::from_wire("SomethingNew") {
            Some(LockError::InvalidRequest(detail)) => assert!(detail.contains("SomethingNew")),
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
