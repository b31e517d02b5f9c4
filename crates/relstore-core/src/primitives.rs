//! # Store Primitives
//!
//! Hardcoded limits and wire constants of the record store.
//!
//! Every identity lookup and every update cycle must be computationally
//! bounded. These defaults feed `StoreOptions` and can be tightened or
//! relaxed per store.

/// Maximum number of candidate object identifiers enumerated for one record
/// or one lookup.
///
/// A relational identity field contributes every local id of its target, so
/// a clause over several still-merging peers fans out multiplicatively.
/// Exceeding the cap is fatal (`StoreError::TooManyCandidates`).
pub const MAX_IDENTITY_CANDIDATES: usize = 1000;

/// Maximum number of queued jobs processed by one outermost update cycle.
///
/// Hooks that keep re-triggering each other would otherwise never settle.
pub const MAX_DRAIN_STEPS: usize = 1_000_000;

// =============================================================================
// RELATION COMMANDS
// =============================================================================

/// Add items to a relation, keeping the inverse side symmetric.
pub const CMD_ADD: &str = "ADD";

/// Remove items from a relation, keeping the inverse side symmetric.
pub const CMD_DELETE: &str = "DELETE";

/// Add items without touching the inverse side.
pub const CMD_ADD_NO_INVERSE: &str = "ADD.noinv";

/// Remove items without touching the inverse side.
pub const CMD_DELETE_NO_INVERSE: &str = "DELETE.noinv";
