//! The immutable compiled representation produced by the compiler and
//! consumed by `Documents::normalize`/`materialize` (spec §3, §4.1).
use std::sync::Arc;

use apollo_compiler::ast;
use indexmap::IndexMap;
use serde_json_bytes::{Map as JsonMap, Value as JsonValue};

use crate::stable_json::stable_args_suffix;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum OperationKind {
    #[strum(to_string = "query")]
    Query,
    #[strum(to_string = "mutation")]
    Mutation,
    #[strum(to_string = "subscription")]
    Subscription,
    #[strum(to_string = "fragment")]
    Fragment,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum ConnectionMode {
    #[strum(to_string = "infinite")]
    Infinite,
    #[strum(to_string = "page")]
    Page,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        ConnectionMode::Infinite
    }
}

/// An argument value as written in the document, with `$variable`
/// references left unresolved until `build_args` substitutes them.
#[derive(Clone, Debug)]
pub enum ArgTemplate {
    Variable(String),
    Literal(JsonValue),
    List(Vec<ArgTemplate>),
    Object(Vec<(String, ArgTemplate)>),
}

impl ArgTemplate {
    fn resolve(&self, variables: &JsonMap) -> JsonValue {
        match self {
            ArgTemplate::Variable(name) => variables.get(name.as_str()).cloned().unwrap_or(JsonValue::Null),
            ArgTemplate::Literal(value) => value.clone(),
            ArgTemplate::List(items) => {
                JsonValue::Array(items.iter().map(|item| item.resolve(variables)).collect())
            }
            ArgTemplate::Object(entries) => {
                let mut map = JsonMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(variables));
                }
                JsonValue::Object(map)
            }
        }
    }
}

/// A compiled field: one entry of a selection set.
#[derive(Clone, Debug)]
pub struct PlanField {
    /// Schema name, used to build storage keys.
    pub field_name: String,
    /// Alias or field name, used when writing response trees.
    pub response_key: String,
    pub args: Vec<(String, ArgTemplate)>,
    pub selection_set: Vec<Arc<PlanField>>,
    /// Insertion-ordered, keyed by `response_key`.
    pub selection_map: IndexMap<String, Arc<PlanField>>,
    pub is_connection: bool,
    pub connection_key: Option<String>,
    pub connection_filters: Vec<String>,
    pub connection_mode: ConnectionMode,
}

impl PlanField {
    /// `buildArgs(variables)` — concrete-arg mapping with `$var` references
    /// substituted.
    pub fn build_args(&self, variables: &JsonMap) -> JsonMap {
        let mut map = JsonMap::new();
        for (name, template) in &self.args {
            map.insert(name.clone(), template.resolve(variables));
        }
        map
    }

    /// `stringifyArgs(variables)` — stable JSON of `build_args`, already
    /// wrapped in `(...)`, or empty for argument-less fields.
    pub fn stringify_args(&self, variables: &JsonMap) -> String {
        if self.args.is_empty() {
            return String::new();
        }
        let resolved = self.build_args(variables);
        stable_args_suffix(&to_serde_json_map(&resolved))
    }

    /// `fieldName` (or `fieldName(<args>)`) — the field-storage-key.
    pub fn storage_key(&self, variables: &JsonMap) -> String {
        format!("{}{}", self.field_name, self.stringify_args(variables))
    }

    /// The schema field name, used as the `<field>` segment of a canonical
    /// connection key (aliases don't affect which logical connection a page
    /// belongs to).
    pub fn storage_field_name(&self) -> &str {
        &self.field_name
    }

    /// Arguments from `build_args` restricted to `connection_filters`, used
    /// to derive the canonical key.
    pub fn canonical_args(&self, variables: &JsonMap) -> String {
        let built = self.build_args(variables);
        let mut filtered = serde_json::Map::new();
        for name in &self.connection_filters {
            if let Some(value) = built.get(name.as_str()) {
                filtered.insert(name.clone(), json_bytes_to_serde(value));
            }
        }
        stable_args_suffix(&filtered)
    }
}

/// serde_json_bytes's `Map` doesn't share a type with `serde_json::Map`;
/// stable-json encoding is defined over the latter, so results get
/// converted at the boundary rather than duplicating the encoder.
fn to_serde_json_map(map: &JsonMap) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    for (key, value) in map.iter() {
        out.insert(key.to_string(), json_bytes_to_serde(value));
    }
    out
}

fn json_bytes_to_serde(value: &JsonValue) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Immutable compiled representation of a document or fragment.
#[derive(Clone, Debug)]
pub struct Plan {
    pub operation: OperationKind,
    pub root_typename: String,
    pub root: Vec<Arc<PlanField>>,
    pub root_selection_map: IndexMap<String, Arc<PlanField>>,
    /// The document with non-network directives stripped and `__typename`
    /// injected, ready to ship to a transport layer. Plans are otherwise
    /// pure; this is kept as data, never executed by this crate.
    pub network_query: ast::Document,
}
