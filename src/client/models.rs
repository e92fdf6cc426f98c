//! DRP object models, in the PascalCase JSON the `/api/v3` endpoints speak.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Actions DRP applies to a machine when it moves between pool states.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoolTransitionActions {
    /// Workflow to start on the machine.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub workflow: String,
    /// Profiles to add.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_profiles: Vec<String>,
    /// Parameters to set.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub add_parameters: BTreeMap<String, serde_json::Value>,
    /// Profiles to remove.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_profiles: Vec<String>,
    /// Parameters to remove.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_parameters: Vec<String>,
}

/// Automatic machine creation/return for a pool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoolAutoFill {
    /// Whether autofill is active.
    pub use_auto_fill: bool,
    /// Pool machines are taken from.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub acquire_pool: String,
    /// Pool machines are returned to.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub return_pool: String,
    /// Free machines above which DRP returns machines.
    pub max_free: i32,
    /// Free machines below which DRP acquires machines.
    pub min_free: i32,
    /// Parameters for machines DRP creates.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub create_parameters: BTreeMap<String, serde_json::Value>,
}

/// A machine pool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Pool {
    /// Pool name.
    pub id: String,
    /// Short description.
    pub description: String,
    /// Longer documentation.
    pub documentation: String,
    /// Parent pool.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_pool: String,
    /// Applied when a machine joins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enter_actions: Option<PoolTransitionActions>,
    /// Applied when a machine leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_actions: Option<PoolTransitionActions>,
    /// Applied on allocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocate_actions: Option<PoolTransitionActions>,
    /// Applied on release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_actions: Option<PoolTransitionActions>,
    /// Autofill settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_fill: Option<PoolAutoFill>,
}

/// A global parameter definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Values must be submitted encrypted.
    pub secure: bool,
    /// JSON schema for values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

/// A machine. Fields this provider does not manage round-trip through `extra`
/// so that a PUT does not clobber them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Machine {
    /// Machine UUID.
    pub uuid: String,
    /// Machine name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Boot environment.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub boot_env: String,
    /// Profiles attached to the machine.
    pub profiles: Vec<String>,
    /// Machine parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Free-form metadata.
    pub meta: BTreeMap<String, String>,
    /// Pool the machine belongs to.
    pub pool: String,
    /// Whether the machine is allocated in its pool.
    pub pool_allocated: bool,
    /// Pool state, e.g. `Free`, `InUse`, `Building`.
    pub pool_status: String,
    /// Whether the current workflow has finished.
    pub workflow_complete: bool,
    /// Whether the machine will run tasks.
    pub runnable: bool,
    /// Everything else.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Body of `POST /pools/<pool>/allocateMachines`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRequest {
    /// Number of machines.
    #[serde(rename = "pool/count")]
    pub count: u32,
    /// Machine filters, `field=value`.
    #[serde(rename = "pool/filter", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

impl AllocationRequest {
    /// Allocate a single machine matching `filters`.
    pub fn single(filters: Vec<String>) -> Self {
        Self { count: 1, filters }
    }
}

/// Body of `POST /pools/<pool>/releaseMachines`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseRequest {
    /// Machines to release.
    #[serde(rename = "pool/machine-list")]
    pub machines: Vec<String>,
}

/// One entry of an allocate/release response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoolResult {
    /// Machine UUID.
    pub uuid: String,
    /// Machine name.
    pub name: String,
    /// Pool status after the operation.
    pub status: String,
    /// Whether the machine is now allocated.
    pub allocated: bool,
}

/// An encrypted parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecureData {
    /// Ephemeral public key of the sender.
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// Box nonce.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Sealed JSON value.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// DRP error body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiError {
    /// HTTP status DRP reports.
    pub code: u16,
    /// Error messages.
    pub messages: Vec<String>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_machine_preserves_unknown_fields() {
        let raw = json!({
            "Uuid": "3d5b3f3c-0000-4000-8000-000000000001",
            "Name": "node-1",
            "PoolStatus": "InUse",
            "WorkflowComplete": true,
            "Address": "10.0.0.5",
            "Stage": "complete"
        });

        let machine: Machine = serde_json::from_value(raw).unwrap();
        assert_eq!(machine.name, "node-1");
        assert!(machine.workflow_complete);
        assert_eq!(machine.extra.get("Address"), Some(&json!("10.0.0.5")));

        let back = serde_json::to_value(&machine).unwrap();
        assert_eq!(back["Stage"], "complete");
        assert_eq!(back["Uuid"], "3d5b3f3c-0000-4000-8000-000000000001");
    }

    #[test]
    fn test_pool_wire_names() {
        let pool = Pool {
            id: "edge".to_string(),
            allocate_actions: Some(PoolTransitionActions {
                workflow: "deploy".to_string(),
                ..Default::default()
            }),
            auto_fill: Some(PoolAutoFill {
                use_auto_fill: true,
                max_free: 3,
                ..Default::default()
            }),
            ..Default::default()
        };

        let value = serde_json::to_value(&pool).unwrap();
        assert_eq!(value["Id"], "edge");
        assert_eq!(value["AllocateActions"]["Workflow"], "deploy");
        assert_eq!(value["AutoFill"]["MaxFree"], 3);
        assert!(value.get("ReleaseActions").is_none());
    }

    #[test]
    fn test_allocation_request_keys() {
        let request = AllocationRequest::single(vec!["Arch=amd64".to_string()]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"pool/count": 1, "pool/filter": ["Arch=amd64"]}));
    }

    #[test]
    fn test_secure_data_is_base64() {
        let data = SecureData {
            key: vec![1, 2, 3],
            nonce: vec![4, 5],
            payload: b"hi".to_vec(),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["Key"], "AQID");
        assert_eq!(value["Payload"], "aGk=");

        let back: SecureData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }
}
