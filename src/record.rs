//! The normalized record model: [`RecordId`], [`FieldValue`], and [`Record`].
//!
//! Per the Design Notes, relationships are represented as [`RecordId`]
//! values rather than pointers, so cycles are safe and removal is a plain
//! map delete. We intern the display form behind an `Arc<str>` rather than
// building a full slab/u64-index arena: ids already flow in and out of the
//! crate's boundary (dehydrate/hydrate, dependency sets) as strings, so a
//! cheap-to-clone interned string pulls most of the weight a slab would
//! without forcing every external-facing API to translate indices back and
//! forth.
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json_bytes::Value as JsonValue;

/// The singleton root record id, `"@"`.
pub const ROOT_ID: &str = "@";

/// Identifies a record in the graph. Cheap to clone (an `Arc<str>` behind
/// the scenes); `Display`/`Deref` give back the wire-format string described
/// in spec §3/§6 (`"@"`, `"Type:id"`, `'@.<parent>.<field>(<args>)'`, …).
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Arc<str>);

impl RecordId {
    pub fn root() -> Self {
        RecordId(Arc::from(ROOT_ID))
    }

    pub fn new(s: impl Into<Arc<str>>) -> Self {
        RecordId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == ROOT_ID
    }

    /// `"<TypeName>:<id>"`.
    pub fn entity(typename: &str, id: &str) -> Self {
        RecordId(Arc::from(format!("{typename}:{id}")))
    }

    /// `'@.<parent>.<field>(<args>)'` — a concrete connection page, or any
    /// other root-relative field link.
    pub fn field_path(parent: &RecordId, storage_key: &str) -> Self {
        RecordId(Arc::from(format!("{}.{}", parent.as_str(), storage_key)))
    }

    /// `'@connection.<parent>.<field>({<canonicalArgs>})'`. The root parent
    /// is elided (matching the concrete-page convention below) rather than
    /// spelled out as `@connection.@.field(...)`.
    pub fn canonical(parent: &RecordId, field: &str, canonical_args: &str) -> Self {
        if parent.is_root() {
            RecordId(Arc::from(format!("@connection.{field}{canonical_args}")))
        } else {
            RecordId(Arc::from(format!(
                "@connection.{}.{field}{canonical_args}",
                parent.as_str()
            )))
        }
    }

    /// `'<canKey>::meta'`.
    pub fn meta_of(canonical_key: &RecordId) -> Self {
        RecordId(Arc::from(format!("{}::meta", canonical_key.as_str())))
    }

    /// `'<pageId>.edges:<index>'`.
    pub fn edge_of(page_id: &RecordId, index: usize) -> Self {
        RecordId(Arc::from(format!("{}.edges:{index}", page_id.as_str())))
    }

    /// `'<pageId>.pageInfo'`.
    pub fn page_info_of(page_id: &RecordId) -> Self {
        RecordId(Arc::from(format!("{}.pageInfo", page_id.as_str())))
    }

    /// A pseudo-key used only for change notifications, never stored as a
    /// real record: `"<parent>.<field>(<args>)"`. Field links happen to use
    /// the same textual shape, so this is mostly a documentation alias.
    pub fn pseudo_field(parent: &RecordId, storage_key: &str) -> Self {
        Self::field_path(parent, storage_key)
    }

    /// `'<canKey>::base'` — the pristine, pre-overlay state Canonical
    /// maintains; Optimistic reads this and writes the user-visible,
    /// patched view to `canKey` itself (spec §4.7 replay contract).
    pub fn base_of(canonical_key: &RecordId) -> Self {
        RecordId(Arc::from(format!("{}::base", canonical_key.as_str())))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({:?})", self.0)
    }
}

impl std::ops::Deref for RecordId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(Arc::from(s))
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(Arc::from(s))
    }
}

/// The value stored under a single field-storage-key in a [`Record`].
///
/// This is the tagged sum the Design Notes ask for in place of raw dynamic
/// JSON: a scalar/embedded value, a single reference, or an ordered list of
/// references. The wire form (spec §6) is untagged on the Rust side too —
/// a `Scalar` serializes as the bare JSON value, `Ref`/`RefList` as
/// `{"__ref": id}`/`{"__refs": [id, ...]}` — so `Serialize`/`Deserialize`
/// are hand-written rather than derived: serde's internally-tagged
/// representation can't encode a newtype variant wrapping a bare string or
/// sequence (`Ref`/`RefList`), which is exactly what every entity link and
/// `__typename` scalar is.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Scalar or embedded (non-entity) JSON, stored as-is.
    Scalar(JsonValue),
    /// `{"__ref": "<id>"}`.
    Ref(RecordId),
    /// `{"__refs": ["<id>", ...]}`.
    RefList(Vec<RecordId>),
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FieldValue::Scalar(value) => value.serialize(serializer),
            FieldValue::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("__ref", id.as_str())?;
                map.end()
            }
            FieldValue::RefList(ids) => {
                let mut map = serializer.serialize_map(Some(1))?;
                let ids: Vec<&str> = ids.iter().map(RecordId::as_str).collect();
                map.serialize_entry("__refs", &ids)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(FieldValue::from_wire(value))
    }
}

impl FieldValue {
    /// Reconstructs a `FieldValue` from its spec §6 wire form: a one-key
    /// `{"__ref": ...}`/`{"__refs": [...]}` object is a link, anything else
    /// is a plain scalar/embedded value.
    fn from_wire(value: JsonValue) -> FieldValue {
        if let JsonValue::Object(obj) = &value {
            if obj.len() == 1 {
                if let Some(JsonValue::String(id)) = obj.get("__ref") {
                    return FieldValue::Ref(RecordId::new(id.as_str()));
                }
                if let Some(JsonValue::Array(items)) = obj.get("__refs") {
                    let ids = items
                        .iter()
                        .filter_map(|item| item.as_str().map(|s| RecordId::from(s)))
                        .collect();
                    return FieldValue::RefList(ids);
                }
            }
        }
        FieldValue::Scalar(value)
    }

    pub fn as_ref_id(&self) -> Option<&RecordId> {
        match self {
            FieldValue::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_ref_list(&self) -> Option<&[RecordId]> {
        match self {
            FieldValue::RefList(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&JsonValue> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Structural equality used by `Graph::put_record` to decide whether a
    /// write actually changes anything (spec §4.3: deep equality for
    /// objects/arrays, SameValueZero for scalars — NaN excepted, which is
    /// always considered different from itself, including from itself).
    pub fn same_value(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Scalar(a), FieldValue::Scalar(b)) => json_same_value(a, b),
            (FieldValue::Ref(a), FieldValue::Ref(b)) => a == b,
            (FieldValue::RefList(a), FieldValue::RefList(b)) => a == b,
            _ => false,
        }
    }
}

fn json_same_value(a: &JsonValue, b: &JsonValue) -> bool {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        if a.is_nan() || b.is_nan() {
            return false;
        }
    }
    a == b
}

/// A normalized record: `__typename` plus an insertion-ordered map of
/// field-storage-key to [`FieldValue`]. Every record must carry
/// `__typename` (spec §3 invariant); callers construct one via
/// [`Record::new`] to make that statically hard to skip.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Record {
    pub fields: IndexMap<String, FieldValue>,
}

impl Record {
    pub fn new(typename: &str) -> Self {
        let mut fields = IndexMap::new();
        fields.insert(
            "__typename".to_string(),
            FieldValue::Scalar(JsonValue::String(typename.into())),
        );
        Record { fields }
    }

    pub fn typename(&self) -> Option<&str> {
        self.fields.get("__typename").and_then(|v| match v {
            FieldValue::Scalar(JsonValue::String(s)) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn get(&self, storage_key: &str) -> Option<&FieldValue> {
        self.fields.get(storage_key)
    }
}
