//! # relstore-core
//!
//! The reactive relational record store - THE LOGIC.
//!
//! Declared models become live records with attributes, to-one and to-many
//! relations, derived fields and a semantic identity. Records that turn out
//! to share an identity are merged. Inverse relations are kept symmetric,
//! deleted records are cut out of everything that references them, and
//! side effects are batched into one drain per outermost update.
//!
//! ## Architectural Constraints
//!
//! - Single owner: one `Store` value, no ambient global
//! - Arena storage: relations hold `LocalId`s, never records
//! - Deterministic: `BTreeMap`/`BTreeSet` only, no floats, no randomness
//! - Pure Rust: no async, no network, no disk
//!
//! ## Example
//!
//! ```
//! use relstore_core::{Field, Model, Store};
//! use serde_json::json;
//!
//! let mut store = Store::builder()
//!     .model(
//!         Model::new("Person")
//!             .identity("ssn")
//!             .field(Field::attr("ssn"))
//!             .field(Field::attr("name")),
//!     )
//!     .build()?;
//!
//! let ann = store.insert("Person", json!({"ssn": "1", "name": "Ann"}))?;
//! let same = store.insert("Person", json!({"ssn": "1", "name": "Annie"}))?;
//! assert_eq!(ann, same);
//! assert_eq!(store.value(ann, "name")?, json!("Annie"));
//! # Ok::<(), relstore_core::StoreError>(())
//! ```

// =============================================================================
// MODULES
// =============================================================================

pub mod export;
pub mod identity;
pub mod integrity;
pub mod primitives;
pub mod record;
pub mod relation;
pub mod schema;
pub mod store;
pub mod tracking;
pub mod types;
pub mod usage;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{FieldId, InsertOptions, Inserted, LocalId, ModelId, RecordRef, StoreError};

// =============================================================================
// RE-EXPORTS: Schema
// =============================================================================

pub use identity::IdentityExpr;
pub use schema::{
    ComputeFn, Computed, Field, FieldKind, HookFn, Model, PeerHookFn, RecordOrderFn, Schema,
    SchemaBuilder, ValueOrderFn,
};

// =============================================================================
// RE-EXPORTS: Store Engine
// =============================================================================

pub use export::{ModelSnapshot, RecordSnapshot, StoreSnapshot};
pub use relation::{RelationCommand, RelationList, RelationMut, RelationOp};
pub use store::{Store, StoreOptions};
pub use tracking::Ctx;
pub use usage::UsageIndex;
