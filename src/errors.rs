//! Error handling module
//!
//! Structured error types for the fabrication engine. Per-object failures
//! are absorbed by the stages that observe them; only configuration-time
//! and ledger-durability errors propagate to the process boundary.

use thiserror::Error;

/// Main error type for directory fabrication operations
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Invalid or inconsistent configuration; fatal, raised before any write.
    /// Carries every violation found, not just the first.
    #[error("invalid configuration: {}", violations.join("; "))]
    Config { violations: Vec<String> },

    /// Retryable directory failure (throttling, transient unavailability)
    #[error("transient directory error: {0}")]
    Transient(String),

    /// Non-retryable directory failure (schema violation, permission denied,
    /// conflicting duplicate); the affected object is marked Failed.
    #[error("permanent directory error: {0}")]
    Permanent(String),

    /// The answer-key ledger could not be durably written; fatal, since an
    /// unrecorded misconfiguration defeats the tool's purpose.
    #[error("ledger write failed: {0}")]
    Ledger(String),

    /// The run was cancelled before this operation could be attempted
    #[error("run cancelled")]
    Cancelled,
}

impl ForgeError {
    /// Single-violation configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ForgeError::Config {
            violations: vec![msg.into()],
        }
    }

    /// Whether retrying the failed operation can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Transient(_))
    }
}

impl From<ldap3::LdapError> for ForgeError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } => {
                match result.rc {
                    // 51 = Busy, 52 = Unavailable: the server may recover
                    51 | 52 => ForgeError::Transient(format!(
                        "server busy/unavailable (rc={}): {}",
                        result.rc, result.text
                    )),
                    // 49 = Invalid credentials
                    49 => ForgeError::Permanent(format!(
                        "invalid credentials: {}",
                        result.text
                    )),
                    // 50 = Insufficient access rights
                    50 => ForgeError::Permanent(format!(
                        "insufficient access rights: {}",
                        result.text
                    )),
                    // 53 = Unwilling to perform (often a policy/schema refusal)
                    53 => ForgeError::Permanent(format!(
                        "server unwilling to perform: {}",
                        result.text
                    )),
                    // 64/65 = naming/objectClass violation
                    64 | 65 => ForgeError::Permanent(format!(
                        "schema violation (rc={}): {}",
                        result.rc, result.text
                    )),
                    _ => ForgeError::Permanent(format!(
                        "LDAP error code {}: {}",
                        result.rc, result.text
                    )),
                }
            }
            // Connection-level failures are worth retrying
            ldap3::LdapError::EndOfStream => {
                ForgeError::Transient("connection closed unexpectedly".to_string())
            }
            ldap3::LdapError::Io { source } => {
                ForgeError::Transient(format!("I/O error: {}", source))
            }
            ldap3::LdapError::Timeout { elapsed: _ } => {
                ForgeError::Transient("LDAP operation timed out".to_string())
            }
            _ => ForgeError::Permanent(format!("LDAP error: {}", err)),
        }
    }
}

impl From<rusqlite::Error> for ForgeError {
    fn from(err: rusqlite::Error) -> Self {
        ForgeError::Ledger(err.to_string())
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Ledger(format!("serialization error: {}", err))
    }
}

/// Result type alias for fabrication operations
pub type Result<T> = std::result::Result<T, ForgeError>;
