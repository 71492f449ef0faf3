//! Construction-time configuration: per-typename keyers and interface
//! membership (spec §3, §6: "Keyers/interfaces/`connections` config are
//! external and supplied at construction").
use std::collections::HashMap;
use std::sync::Arc;

use serde_json_bytes::Value as JsonValue;

/// Computes the id portion of a `"<TypeName>:<id>"` [`RecordId`] from a raw
/// response object. Returning `None` means the type is embedded rather than
/// normalized (spec §3).
pub type Keyer = Arc<dyn Fn(&JsonValue) -> Option<String> + Send + Sync>;

/// Construction-time cache configuration.
#[derive(Clone, Default)]
pub struct CacheConfig {
    keyers: HashMap<String, Keyer>,
    /// interface name -> concrete member typenames.
    interfaces: HashMap<String, Vec<String>>,
    /// concrete typename -> interface name, the inverse of `interfaces`,
    /// kept alongside it so `identify` doesn't rebuild it on every call.
    interface_of: HashMap<String, String>,
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    pub fn keyer_for(&self, typename: &str) -> Option<&Keyer> {
        self.keyers.get(typename)
    }

    /// Resolves `typename` to the name that should anchor its entity key:
    /// itself, unless it's a declared member of an interface, in which case
    /// the interface name is returned (`AudioPost` -> `Post`).
    pub fn identity_typename<'a>(&'a self, typename: &'a str) -> &'a str {
        self.interface_of
            .get(typename)
            .map(String::as_str)
            .unwrap_or(typename)
    }
}

/// Default keyer: stringifies the `id` field if present.
fn default_keyer(value: &JsonValue) -> Option<String> {
    match value.get("id") {
        Some(JsonValue::String(s)) => Some(s.as_str().to_string()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Default)]
pub struct CacheConfigBuilder {
    keyers: HashMap<String, Keyer>,
    interfaces: HashMap<String, Vec<String>>,
}

impl CacheConfigBuilder {
    /// Registers a custom keyer for `typename`. Types without one use
    /// [`default_keyer`] (stringified `id` field).
    pub fn keyer(
        mut self,
        typename: impl Into<String>,
        keyer: impl Fn(&JsonValue) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.keyers.insert(typename.into(), Arc::new(keyer));
        self
    }

    /// Declares that `members` are concrete types of the interface
    /// `interface_name`; their entity ids are anchored under
    /// `interface_name` instead of their own typename.
    pub fn interface(
        mut self,
        interface_name: impl Into<String>,
        members: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.interfaces.insert(
            interface_name.into(),
            members.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn build(self) -> CacheConfig {
        let mut interface_of = HashMap::new();
        for (interface_name, members) in &self.interfaces {
            for member in members {
                interface_of.insert(member.clone(), interface_name.clone());
            }
        }
        CacheConfig {
            keyers: self.keyers,
            interfaces: self.interfaces,
            interface_of,
        }
    }
}

/// Resolves an entity id for `value` (which must carry `__typename`), honoring
/// custom keyers and interface membership; used by [`crate::Cache::identify`]
/// and by the normalizer.
pub fn identify(config: &CacheConfig, value: &JsonValue) -> Option<crate::record::RecordId> {
    let typename = value.get("__typename")?.as_str()?;
    let id = match config.keyer_for(typename) {
        Some(keyer) => keyer(value)?,
        None => default_keyer(value)?,
    };
    let anchor = config.identity_typename(typename);
    Some(crate::record::RecordId::entity(anchor, &id))
}
