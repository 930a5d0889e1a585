//! Licensor error types.

use crate::protocol::receipt::ReceiptParseError;
use thiserror::Error;

/// Errors that can occur while managing licenses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LicensorError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No tokio runtime is available to host the manager's dispatcher.
    #[error("No async runtime available: {0}")]
    RuntimeUnavailable(String),

    /// A feature, product or provider with this identifier is already registered.
    #[error("Duplicate {kind} identifier: {identifier}")]
    DuplicateIdentifier {
        /// What kind of entity collided ("feature", "product", "provider").
        kind: &'static str,
        /// The colliding identifier.
        identifier: String,
    },

    /// No provider with this identifier is registered.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider cannot be added alongside an already active one.
    #[error("Provider conflict: {0}")]
    ProviderConflict(String),

    /// A provider failed to start or refresh.
    #[error("Provider {provider} failed to load: {reason}")]
    ProviderLoad {
        /// Identifier of the failing provider.
        provider: String,
        /// Failure description.
        reason: String,
    },

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A receipt could not be parsed.
    #[error("Receipt parse error: {0}")]
    ReceiptParse(#[from] ReceiptParseError),

    /// An offer could not be committed.
    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    /// An applicability rule expression is malformed.
    #[error("Invalid applicability rule {source_text:?}: {reason}")]
    ApplicabilityRule {
        /// The rule text as supplied.
        source_text: String,
        /// Parse failure description.
        reason: String,
    },

    /// Provider storage I/O error.
    #[error("Storage I/O error: {0}")]
    StorageIO(String),

    /// A stored record failed its integrity check.
    #[error("Stored record tampering detected")]
    StorageTampered,
}

/// Reasons an offer commit can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    /// The offer's provider does not support committing it.
    #[error("offer has no commit handler")]
    NoCommitHandler,

    /// Purchases are disabled on this device (parental controls, volume purchase).
    #[error("purchases are not allowed on this device")]
    PurchasesNotAllowed,

    /// The offer is outside its availability window or flagged unavailable.
    #[error("offer is not available")]
    Unavailable,

    /// A commit for this offer is already in progress.
    #[error("commit already in progress")]
    AlreadyInProgress,

    /// The user cancelled the purchase flow.
    #[error("cancelled by user")]
    UserCancelled,

    /// The purchase flow failed.
    #[error("{0}")]
    Failed(String),
}
