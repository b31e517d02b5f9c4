//! # Core Type Definitions
//!
//! This module contains the shared types of the record store:
//! - Record and schema identifiers (`LocalId`, `ModelId`, `FieldId`)
//! - Write inputs (`RecordRef`, `InsertOptions`, `Inserted`)
//! - Error types (`StoreError`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers:
//! - Are plain integers
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`
//! - Are never reused once handed out

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// SCHEMA IDENTIFIERS
// =============================================================================

/// Index of a model inside the assembled schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelId(pub u32);

impl ModelId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a field inside its model's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

impl FieldId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// =============================================================================
// LOCAL IDENTIFIER
// =============================================================================

/// Process-unique handle of a record.
///
/// Assigned monotonically per model at creation and never reused. After a
/// reconciliation a record owns several local ids; any of them keeps working
/// as a handle and resolves to the merged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId {
    /// The model the record was created in.
    pub model: ModelId,
    /// Sequence number inside that model, starting at 1.
    pub seq: u64,
}

impl LocalId {
    #[must_use]
    pub const fn new(model: ModelId, seq: u64) -> Self {
        Self { model, seq }
    }
}

/// `(record, field)` pair used by the tracker and the update queues.
pub(crate) type FieldKey = (LocalId, FieldId);

// =============================================================================
// WRITE INPUTS
// =============================================================================

/// An item written into a relation: either an existing record or raw data
/// that is resolved (or created) in the target model.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordRef {
    /// An existing record handle.
    Id(LocalId),
    /// Raw data for the target model (object, or identity shorthand).
    Data(Value),
}

impl From<LocalId> for RecordRef {
    fn from(id: LocalId) -> Self {
        Self::Id(id)
    }
}

impl From<Value> for RecordRef {
    fn from(data: Value) -> Self {
        Self::Data(data)
    }
}

/// Options accepted by `insert`/`update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOptions {
    /// Treat strings written into markup-flagged attributes as trusted markup.
    /// Untrusted strings are HTML-escaped. Defaults to `false`.
    #[serde(default)]
    pub trusted: bool,
}

impl InsertOptions {
    #[must_use]
    pub const fn trusted() -> Self {
        Self { trusted: true }
    }
}

/// Result of an insert that may carry one object or an ordered sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted {
    One(LocalId),
    Many(Vec<LocalId>),
}

impl Inserted {
    /// All inserted ids in input order.
    #[must_use]
    pub fn ids(&self) -> Vec<LocalId> {
        match self {
            Self::One(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by the record store.
///
/// Schema errors are raised once, when the store is built. Everything else
/// aborts the triggering call; there is no partial-state rollback.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Two models were declared with the same name.
    #[error("Duplicate model: {0}")]
    DuplicateModel(String),

    /// A model declares the same field name twice.
    #[error("Duplicate field {field} on model {model}")]
    DuplicateField { model: String, field: String },

    /// A relation points at a model that is not part of the schema.
    #[error("Field {model}.{field} targets unknown model {target}")]
    UnknownTarget {
        model: String,
        field: String,
        target: String,
    },

    /// A declared inverse is missing or does not point back.
    #[error("Inverse mismatch on {model}.{field}: {reason}")]
    InverseMismatch {
        model: String,
        field: String,
        reason: String,
    },

    /// The identity expression cannot be used to identify records.
    #[error("Invalid identity on model {model}: {reason}")]
    InvalidIdentity { model: String, reason: String },

    /// A field declaration is inconsistent with its kind.
    #[error("Invalid field {model}.{field}: {reason}")]
    InvalidField {
        model: String,
        field: String,
        reason: String,
    },

    /// The requested model does not exist.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The requested field does not exist on the model.
    #[error("Unknown field {field} on model {model}")]
    UnknownField { model: String, field: String },

    /// The record handle does not resolve to a live record.
    #[error("Record not found: {0:?}")]
    RecordNotFound(LocalId),

    /// A read or write used the wrong accessor for the field kind.
    #[error("Field {model}.{field} is {actual}, expected {expected}")]
    FieldKind {
        model: String,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Non-object data was given to a model without exactly one
    /// single-field identity clause.
    #[error("Model {0} has no unique single-field identity for shorthand data")]
    IdentityShorthand(String),

    /// An array was given where one record's data is expected.
    #[error("Model {0} expects one object or identity value, got an array; use insert_many or insert_with")]
    ArrayData(String),

    /// A relation command list is malformed.
    #[error("Invalid relation command: {0}")]
    InvalidCommand(String),

    /// Candidate identity enumeration exceeded the configured cap.
    #[error("Too many candidate identities on model {model}: {count} exceeds {limit}")]
    TooManyCandidates {
        model: String,
        count: usize,
        limit: usize,
    },

    /// The update cycle kept producing work past the step cap.
    #[error("Update cycle did not settle after {0} steps")]
    DrainOverflow(usize),

    /// A store invariant does not hold.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// A user hook or compute function reported a failure.
    #[error("Hook failed: {0}")]
    Hook(String),
}

// =============================================================================
// TESTS
// =============================================================================
