//! The DRP resource types and their registry.
//!
//! Each resource works on the JSON state the host sends and is handed the
//! configured [`DrpApi`] for every remote call.

pub mod instance;
pub mod pool;
pub mod profile_param;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::client::DrpApi;
use crate::error::ProviderError;
use crate::plan::plan_resource;
use crate::schema::{Diagnostic, Schema};
use crate::types::PlanResult;
use crate::validation::validate;

pub use instance::InstanceResource;
pub use pool::PoolResource;
pub use profile_param::ProfileParamResource;

/// A resource type backed by DRP.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Type name used in configuration, e.g. `drp_pool`.
    fn type_name(&self) -> &'static str;

    /// The resource schema.
    fn schema(&self) -> Schema;

    /// Check a configuration block against the schema.
    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        validate(&self.schema(), config)
    }

    /// Plan a change from `prior` to `proposed`.
    fn plan(&self, prior: Option<&Value>, proposed: Value) -> PlanResult {
        plan_resource(&self.schema(), prior, proposed)
    }

    /// Migrate state written at an older schema version.
    fn upgrade_state(&self, version: i64, state: Value) -> Result<Value, ProviderError> {
        let _ = version;
        Ok(state)
    }

    /// Create the remote object described by `planned` and return its state.
    async fn create(&self, api: &dyn DrpApi, planned: Value) -> Result<Value, ProviderError>;

    /// Refresh `current` from the remote object.
    async fn read(&self, api: &dyn DrpApi, current: Value) -> Result<Value, ProviderError>;

    /// Apply an in-place change.
    async fn update(
        &self,
        api: &dyn DrpApi,
        prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError>;

    /// Remove the remote object.
    async fn delete(&self, api: &dyn DrpApi, current: Value) -> Result<(), ProviderError>;

    /// Build state for an existing remote object.
    async fn import(&self, api: &dyn DrpApi, id: &str) -> Result<Value, ProviderError>;
}

/// Resources keyed by type name.
pub struct ResourceRegistry {
    resources: BTreeMap<&'static str, Box<dyn Resource>>,
}

impl ResourceRegistry {
    /// A registry with no resources.
    pub fn empty() -> Self {
        Self {
            resources: BTreeMap::new(),
        }
    }

    /// Add a resource, replacing any with the same type name.
    pub fn register(mut self, resource: impl Resource + 'static) -> Self {
        self.resources.insert(resource.type_name(), Box::new(resource));
        self
    }

    /// Look up a resource by type name.
    pub fn get(&self, type_name: &str) -> Result<&dyn Resource, ProviderError> {
        self.resources
            .get(type_name)
            .map(|r| r.as_ref())
            .ok_or_else(|| ProviderError::UnknownResource(type_name.to_string()))
    }

    /// All resources, ordered by type name.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Resource> {
        self.resources.values().map(|r| r.as_ref())
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::empty()
            .register(InstanceResource)
            .register(PoolResource)
            .register(ProfileParamResource)
    }
}

/// A non-empty string attribute.
pub(crate) fn string_attr<'a>(state: &'a Value, name: &str) -> Option<&'a str> {
    state
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// A string attribute that has to be set.
pub(crate) fn required_string<'a>(state: &'a Value, name: &str) -> Result<&'a str, ProviderError> {
    string_attr(state, name)
        .ok_or_else(|| ProviderError::Validation(format!("attribute \"{}\" is required", name)))
}

/// Non-empty strings of a list attribute.
pub(crate) fn string_list(state: &Value, name: &str) -> Vec<String> {
    state
        .get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The state as a mutable object; `null` becomes an empty one.
pub(crate) fn into_object(state: Value) -> Result<Map<String, Value>, ProviderError> {
    match state {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ProviderError::InvalidRequest(format!(
            "expected an object state, got {}",
            other
        ))),
    }
}

/// Set `name` to `value`, or remove it when `value` is empty.
pub(crate) fn set_string(state: &mut Map<String, Value>, name: &str, value: &str) {
    if value.is_empty() {
        state.remove(name);
    } else {
        state.insert(name.to_string(), Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry() {
        let registry = ResourceRegistry::default();
        let names: Vec<_> = registry.iter().map(|r| r.type_name()).collect();
        assert_eq!(names, vec!["drp_instance", "drp_pool", "drp_profile_param"]);

        let err = registry.get("drp_stage").err().unwrap();
        assert!(matches!(err, ProviderError::UnknownResource(ref name) if name == "drp_stage"));
    }

    #[test]
    fn test_state_helpers() {
        let state = json!({"a": "x", "b": "", "list": ["p1", "", 3, "p2"]});

        assert_eq!(string_attr(&state, "a"), Some("x"));
        assert_eq!(string_attr(&state, "b"), None);
        assert!(required_string(&state, "b").is_err());
        assert_eq!(string_list(&state, "list"), vec!["p1", "p2"]);
        assert!(string_list(&state, "missing").is_empty());

        assert!(into_object(Value::Null).unwrap().is_empty());
        assert!(into_object(json!([1])).is_err());

        let mut obj = into_object(state).unwrap();
        set_string(&mut obj, "a", "");
        set_string(&mut obj, "c", "y");
        assert!(!obj.contains_key("a"));
        assert_eq!(obj["c"], "y");
    }
}
