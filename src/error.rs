//! Error types for cardvault

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// A single reason a candidate passphrase was rejected by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyViolation {
    Empty,
    TooShort { min: usize },
    MissingLowercase,
    MissingUppercase,
    MissingDigit,
    MissingSymbol,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::Empty => write!(f, "passphrase is empty"),
            PolicyViolation::TooShort { min } => {
                write!(f, "passphrase must be at least {} characters", min)
            }
            PolicyViolation::MissingLowercase => write!(f, "needs a lowercase letter"),
            PolicyViolation::MissingUppercase => write!(f, "needs an uppercase letter"),
            PolicyViolation::MissingDigit => write!(f, "needs a digit"),
            PolicyViolation::MissingSymbol => write!(f, "needs a symbol"),
        }
    }
}

/// Main error type for cardvault
#[derive(Error, Debug)]
pub enum Error {
    // Session errors
    #[error("No active passphrase session")]
    NoActiveSession,

    #[error("Passphrase too weak: {}", join_violations(.0))]
    WeakPassphrase(Vec<PolicyViolation>),

    #[error("Passphrases do not match")]
    PassphraseMismatch,

    #[error("The passphrase cannot be recovered; acknowledgement is required")]
    AcknowledgementRequired,

    #[error("Invalid setup transition: {0}")]
    InvalidTransition(String),

    #[error("No authenticated user session")]
    NotAuthenticated,

    // Crypto errors
    #[error("Authentication failed: wrong passphrase or corrupted data")]
    AuthenticationFailed,

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    // Storage errors
    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Vault is not initialized on the remote store")]
    VaultNotInitialized,

    #[error("Vault already initialized on the remote store")]
    VaultAlreadyInitialized,

    // Sync errors
    #[error("A sync pass is already in progress")]
    SyncAlreadyInProgress,

    #[error("Operation cancelled")]
    Cancelled,

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_violations(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Classification of a failure recorded in a sync report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoActiveSession,
    NotAuthenticated,
    AuthenticationFailed,
    MalformedInput,
    NotFound,
    NetworkFailure,
    Cancelled,
    Other,
}

impl Error {
    /// Classify the error for per-item outcome reporting
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::NoActiveSession => FailureKind::NoActiveSession,
            Error::NotAuthenticated => FailureKind::NotAuthenticated,
            Error::AuthenticationFailed => FailureKind::AuthenticationFailed,
            Error::MalformedInput(_) | Error::Serialization(_) => FailureKind::MalformedInput,
            Error::NotFound(_) => FailureKind::NotFound,
            Error::NetworkFailure(_) | Error::Io(_) => FailureKind::NetworkFailure,
            Error::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }

    /// Whether a storage call that failed with this error may be retried
    /// without user input
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkFailure(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
