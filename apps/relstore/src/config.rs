//! # Schema Files
//!
//! TOML description of a store:
//!
//! ```toml
//! [store]
//! max_identity_candidates = 1000
//!
//! [[model]]
//! name = "Contact"
//! identity = ["email", "phone"]        # OR of clauses
//!
//! [[model.field]]
//! name = "email"
//!
//! [[model]]
//! name = "Message"
//! identity = [["thread", "id"]]       # inner list is an AND clause
//!
//! [[model.field]]
//! name = "thread"
//! kind = "one"
//! target = "Thread"
//! inverse = "messages"
//! ```
//!
//! `sort` on a relation names a target attribute (`"date"`, or `"-date"`
//! for descending); on an attribute it is `"asc"` or `"desc"`.

use crate::error::CliError;
use relstore_core::{
    Field, FieldKind, IdentityExpr, Model, SchemaBuilder, Store, StoreOptions,
};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::path::Path;

/// Largest schema file accepted (1 MB).
pub const MAX_SCHEMA_FILE_SIZE: u64 = 1024 * 1024;

/// Read a whole file, refusing anything over `limit` bytes.
pub fn read_limited(path: &Path, limit: u64) -> Result<String, CliError> {
    let io = |source| CliError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(io)?.len();
    if size > limit {
        return Err(CliError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit,
        });
    }
    std::fs::read_to_string(path).map_err(io)
}

// =============================================================================
// FILE FORMAT
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaFile {
    #[serde(default)]
    pub store: StoreOptions,
    #[serde(default, rename = "model")]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub identity: Vec<IdentityClause>,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldConfig>,
}

/// One alternative of an identity: a field, or fields that identify together.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IdentityClause {
    Field(String),
    All(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindConfig {
    #[default]
    Attr,
    One,
    Many,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    pub name: String,
    #[serde(default)]
    pub kind: KindConfig,
    pub target: Option<String>,
    pub inverse: Option<String>,
    pub default: Option<Value>,
    #[serde(default)]
    pub html: bool,
    #[serde(default)]
    pub eager: bool,
    pub sort: Option<String>,
}

// =============================================================================
// CONVERSION
// =============================================================================

impl SchemaFile {
    pub fn parse(text: &str) -> Result<Self, CliError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, CliError> {
        let schema = Self::parse(&read_limited(path, MAX_SCHEMA_FILE_SIZE)?)?;
        tracing::debug!(path = %path.display(), models = schema.models.len(), "loaded schema");
        Ok(schema)
    }

    pub fn builder(&self) -> Result<SchemaBuilder, CliError> {
        let mut builder = Store::builder().options(self.store);
        for model in &self.models {
            builder = builder.model(model.to_model()?);
        }
        Ok(builder)
    }

    /// Assemble the store the file describes.
    pub fn build(&self) -> Result<Store, CliError> {
        Ok(self.builder()?.build()?)
    }
}

impl ModelConfig {
    fn identity_expr(&self) -> Option<IdentityExpr> {
        let mut clauses: Vec<IdentityExpr> = self
            .identity
            .iter()
            .map(|clause| match clause {
                IdentityClause::Field(name) => IdentityExpr::field(name.as_str()),
                IdentityClause::All(names) => IdentityExpr::and(names.iter().map(String::as_str)),
            })
            .collect();
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(IdentityExpr::or(clauses)),
        }
    }

    pub fn to_model(&self) -> Result<Model, CliError> {
        let mut model = Model::new(self.name.as_str());
        if self.singleton {
            model = model.singleton();
        }
        if let Some(identity) = self.identity_expr() {
            model = model.identity(identity);
        }
        for field in &self.fields {
            model = model.field(field.to_field(&self.name)?);
        }
        Ok(model)
    }
}

impl FieldConfig {
    fn target(&self, model: &str) -> Result<&str, CliError> {
        self.target.as_deref().ok_or_else(|| {
            CliError::Config(format!("relation {model}.{} has no target", self.name))
        })
    }

    pub fn to_field(&self, model: &str) -> Result<Field, CliError> {
        let mut field = match self.kind {
            KindConfig::Attr => Field::attr(self.name.as_str()),
            KindConfig::One => Field::one(self.name.as_str(), self.target(model)?),
            KindConfig::Many => Field::many(self.name.as_str(), self.target(model)?),
        };
        if let Some(inverse) = &self.inverse {
            field = field.inverse(inverse.as_str());
        }
        if let Some(default) = &self.default {
            field = field.default(default.clone());
        }
        if self.html {
            field = field.html();
        }
        if self.eager {
            field = field.eager();
        }
        if let Some(sort) = &self.sort {
            field = self.with_sort(field, model, sort)?;
        }
        Ok(field)
    }

    fn with_sort(&self, field: Field, model: &str, sort: &str) -> Result<Field, CliError> {
        if field.kind() == FieldKind::Attr {
            return match sort {
                "asc" => Ok(field.sort_values(compare_values)),
                "desc" => Ok(field.sort_values(|a, b| compare_values(b, a))),
                other => Err(CliError::Config(format!(
                    "sort of attribute {model}.{} must be asc or desc, got {other:?}",
                    self.name
                ))),
            };
        }
        let (attr, descending) = match sort.strip_prefix('-') {
            Some(attr) => (attr.to_string(), true),
            None => (sort.to_string(), false),
        };
        if attr.is_empty() {
            return Err(CliError::Config(format!(
                "sort of relation {model}.{} names no attribute",
                self.name
            )));
        }
        Ok(field.sort_by(move |ctx, a, b| {
            let a = ctx.get_of(a, &attr)?;
            let b = ctx.get_of(b, &attr)?;
            let order = compare_values(&a, &b);
            Ok(if descending { order.reverse() } else { order })
        }))
    }
}

// =============================================================================
// VALUE ORDER
// =============================================================================

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order on JSON values: null, booleans, numbers, strings, arrays,
/// then objects (all equal).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x.cmp(&y);
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x.cmp(&y);
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => Ordering::Equal,
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (x, y) in x.iter().zip(y) {
                let order = compare_values(x, y);
                if order != Ordering::Equal {
                    return order;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

// =============================================================================
// TESTS
// =============================================================================
