//! Test support: an in-memory DRP server and a harness for driving a
//! [`ProviderService`] without gRPC.
//!
//! ```ignore
//! use std::sync::Arc;
//! use terraform_provider_drp::provider::DrpProvider;
//! use terraform_provider_drp::testing::{MemoryDrp, ProviderTester};
//!
//! let drp = Arc::new(MemoryDrp::new());
//! let tester = ProviderTester::new(DrpProvider::with_api(drp.clone()));
//! let state = tester
//!     .lifecycle_create("drp_pool", json!({"pool_id": "edge"}))
//!     .await?;
//! assert_eq!(state["id"], "edge");
//! ```

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::models::{AllocationRequest, Machine, Param, Pool};
use crate::client::DrpApi;
use crate::error::ProviderError;
use crate::schema::{Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::server::ProviderService;
use crate::status::MachineStatus;
use crate::types::{ImportedResource, PlanResult};

/// Drives a [`ProviderService`] directly.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Wrap `provider`.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The provider's schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Validate the provider block; error diagnostics become `Err`.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.validate_provider_config(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Configure the provider; error diagnostics become `Err`.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Validate a resource block; error diagnostics become `Err`.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a create.
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed_state.clone(), proposed_state)
            .await
    }

    /// Plan an update of `prior_state`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    /// Plan a destroy.
    pub async fn plan_delete(
        &self,
        resource_type: &str,
        prior_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null, Value::Null)
            .await
    }

    /// Create a resource.
    pub async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned_state).await
    }

    /// Refresh a resource.
    pub async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current_state).await
    }

    /// Update a resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Delete a resource.
    pub async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current_state).await
    }

    /// Import a resource by id.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Upgrade state written at `version`.
    pub async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .upgrade_resource_state(resource_type, version, state)
            .await
    }

    /// Plan, create, then read back.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// Plan, update, then read back.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;
        let updated = self
            .update(resource_type, prior_state, plan.planned_state)
            .await?;
        self.read(resource_type, updated).await
    }

    /// Plan a destroy, then delete.
    pub async fn lifecycle_delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.plan_delete(resource_type, current_state.clone())
            .await?;
        self.delete(resource_type, current_state).await
    }

    /// Create, update, then delete. Returns the state after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<Value, ProviderError> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = self
            .lifecycle_update(resource_type, created, updated_config)
            .await?;
        self.lifecycle_delete(resource_type, updated.clone())
            .await?;
        Ok(updated)
    }
}

/// Failure of a [`ProviderTester`] call.
#[derive(Debug)]
pub enum TestError {
    /// The call returned error diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The call failed outright.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.summary)?;
                    if let Some(detail) = &diag.detail {
                        write!(f, ": {}", detail)?;
                    }
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            },
            TestError::Provider(e) => write!(f, "Provider error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics
        .into_iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

/// Assert that a plan creates without replacing.
///
/// # Panics
///
/// Panics if the plan has no changes or requires replacement.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(
        !plan.changes.is_empty(),
        "Expected plan to have changes for create, but got no changes"
    );
    assert!(
        !plan.requires_replace,
        "Expected plan to create, not replace"
    );
}

/// Assert that a plan has no changes.
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "Expected no changes, but got {} change(s): {:?}",
        plan.changes.len(),
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that a plan requires replacement.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, but it does not"
    );
}

/// Assert that a plan changes something in place.
///
/// # Panics
///
/// Panics if the plan has no changes or requires replacement.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(
        !plan.changes.is_empty(),
        "Expected plan to have changes, but got no changes"
    );
    assert!(
        !plan.requires_replace,
        "Expected plan to update in place, but it requires replacement"
    );
}

/// Assert that a plan changes `path`.
///
/// # Panics
///
/// Panics if no change has the given path.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    let has_change = plan.changes.iter().any(|c| c.path == path);
    assert!(
        has_change,
        "Expected plan to change attribute '{}', but it was not changed. Changed attributes: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that some error's summary contains `substring`.
///
/// # Panics
///
/// Panics if no error diagnostic matches.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    let has_matching_error = diagnostics
        .iter()
        .any(|d| matches!(d.severity, DiagnosticSeverity::Error) && d.summary.contains(substring));

    assert!(
        has_matching_error,
        "Expected an error containing '{}', but no matching error found. Errors: {:?}",
        substring,
        diagnostics
            .iter()
            .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

#[derive(Debug, Default)]
struct MemoryState {
    params: BTreeMap<String, Param>,
    profile_params: BTreeMap<(String, String), Value>,
    public_keys: BTreeMap<String, Vec<u8>>,
    pools: BTreeMap<String, Pool>,
    machines: BTreeMap<String, Machine>,
    status_scripts: BTreeMap<String, VecDeque<MachineStatus>>,
    failures: BTreeMap<String, u16>,
    calls: Vec<String>,
}

impl MemoryState {
    fn check(&self, operation: &str) -> Result<(), ProviderError> {
        match self.failures.get(operation) {
            Some(&status) => Err(ProviderError::from_status(
                status,
                format!("injected {} failure", operation),
            )),
            None => Ok(()),
        }
    }

    fn machine_mut(&mut self, uuid: &str) -> Result<&mut Machine, ProviderError> {
        self.machines
            .get_mut(uuid)
            .ok_or_else(|| ProviderError::NotFound(format!("machines/{}", uuid)))
    }
}

/// An in-memory [`DrpApi`].
///
/// Allocation hands out the first free machine of the pool. Machine statuses
/// follow a per-machine script when one is set: each probe consumes one
/// entry and the last entry repeats. Mutating machine calls are recorded and
/// returned by [`MemoryDrp::calls`].
#[derive(Debug, Default)]
pub struct MemoryDrp {
    state: Mutex<MemoryState>,
}

impl MemoryDrp {
    /// An empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global param definition.
    pub fn with_param(mut self, param: Param) -> Self {
        let state = self.state.get_mut();
        state.params.insert(param.name.clone(), param);
        self
    }

    /// Set the public key of `profile`.
    pub fn with_public_key(mut self, profile: &str, key: &[u8]) -> Self {
        self.state
            .get_mut()
            .public_keys
            .insert(profile.to_string(), key.to_vec());
        self
    }

    /// Add a machine.
    pub fn with_machine(mut self, machine: Machine) -> Self {
        self.state
            .get_mut()
            .machines
            .insert(machine.uuid.clone(), machine);
        self
    }

    /// Script the statuses reported for `uuid`.
    pub fn with_status_script(mut self, uuid: &str, statuses: Vec<MachineStatus>) -> Self {
        self.state
            .get_mut()
            .status_scripts
            .insert(uuid.to_string(), statuses.into());
        self
    }

    /// Fail every `operation` call (a [`DrpApi`] method name) with `status`.
    pub fn with_failure(mut self, operation: &str, status: u16) -> Self {
        self.state
            .get_mut()
            .failures
            .insert(operation.to_string(), status);
        self
    }

    /// Add a machine to a shared server.
    pub async fn add_machine(&self, machine: Machine) {
        self.state
            .lock()
            .await
            .machines
            .insert(machine.uuid.clone(), machine);
    }

    /// Replace the status script of `uuid`.
    pub async fn script_status(&self, uuid: &str, statuses: Vec<MachineStatus>) {
        self.state
            .lock()
            .await
            .status_scripts
            .insert(uuid.to_string(), statuses.into());
    }

    /// Recorded machine calls, e.g. `release_machine default m1`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl DrpApi for MemoryDrp {
    async fn get_param(&self, name: &str) -> Result<Option<Param>, ProviderError> {
        let state = self.state.lock().await;
        state.check("get_param")?;
        Ok(state.params.get(name).cloned())
    }

    async fn get_profile_param(&self, profile: &str, name: &str) -> Result<Value, ProviderError> {
        let state = self.state.lock().await;
        state.check("get_profile_param")?;
        state
            .profile_params
            .get(&(profile.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("profiles/{}/params/{}", profile, name)))
    }

    async fn set_profile_param(
        &self,
        profile: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.check("set_profile_param")?;
        state
            .profile_params
            .insert((profile.to_string(), name.to_string()), value.clone());
        Ok(())
    }

    async fn delete_profile_param(&self, profile: &str, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.check("delete_profile_param")?;
        state
            .profile_params
            .remove(&(profile.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("profiles/{}/params/{}", profile, name)))
    }

    async fn profile_public_key(&self, profile: &str) -> Result<Vec<u8>, ProviderError> {
        let state = self.state.lock().await;
        state.check("profile_public_key")?;
        state
            .public_keys
            .get(profile)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("profiles/{}/pubkey", profile)))
    }

    async fn create_pool(&self, pool: &Pool) -> Result<Pool, ProviderError> {
        let mut state = self.state.lock().await;
        state.check("create_pool")?;
        if state.pools.contains_key(&pool.id) {
            return Err(ProviderError::AlreadyExists(format!("pools/{}", pool.id)));
        }
        state.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool.clone())
    }

    async fn get_pool(&self, id: &str) -> Result<Pool, ProviderError> {
        let state = self.state.lock().await;
        state.check("get_pool")?;
        state
            .pools
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("pools/{}", id)))
    }

    async fn update_pool(&self, pool: &Pool) -> Result<Pool, ProviderError> {
        let mut state = self.state.lock().await;
        state.check("update_pool")?;
        let stored = state
            .pools
            .get_mut(&pool.id)
            .ok_or_else(|| ProviderError::NotFound(format!("pools/{}", pool.id)))?;
        *stored = pool.clone();
        Ok(pool.clone())
    }

    async fn delete_pool(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.check("delete_pool")?;
        state
            .pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("pools/{}", id)))
    }

    async fn allocate_machine(
        &self,
        pool: &str,
        request: &AllocationRequest,
    ) -> Result<Machine, ProviderError> {
        let mut state = self.state.lock().await;
        state.check("allocate_machine")?;
        state.calls.push(
            format!("allocate_machine {} {}", pool, request.filters.join(","))
                .trim_end()
                .to_string(),
        );

        let machine = state
            .machines
            .values_mut()
            .find(|m| m.pool == pool && m.pool_status == "Free" && !m.pool_allocated)
            .ok_or_else(|| {
                ProviderError::ResourceExhausted(format!("no machine available in pool {}", pool))
            })?;
        machine.pool_allocated = true;
        machine.pool_status = "HoldBuild".to_string();
        Ok(machine.clone())
    }

    async fn release_machine(&self, pool: &str, uuid: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.check("release_machine")?;
        state.calls.push(format!("release_machine {} {}", pool, uuid));

        let machine = state.machine_mut(uuid)?;
        machine.pool = pool.to_string();
        machine.pool_allocated = false;
        machine.pool_status = "Free".to_string();
        Ok(())
    }

    async fn get_machine(&self, uuid: &str) -> Result<Machine, ProviderError> {
        let mut state = self.state.lock().await;
        state.check("get_machine")?;
        state.machine_mut(uuid).map(|m| m.clone())
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, ProviderError> {
        let mut state = self.state.lock().await;
        state.check("update_machine")?;
        state.calls.push(format!("update_machine {}", machine.uuid));

        let stored = state.machine_mut(&machine.uuid)?;
        *stored = machine.clone();
        Ok(machine.clone())
    }

    async fn machine_action(&self, uuid: &str, action: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.check("machine_action")?;
        state.machine_mut(uuid)?;
        state.calls.push(format!("machine_action {} {}", uuid, action));
        Ok(())
    }

    async fn machine_status(&self, uuid: &str) -> Result<MachineStatus, ProviderError> {
        let mut state = self.state.lock().await;
        state.check("machine_status")?;
        if let Some(script) = state.status_scripts.get_mut(uuid) {
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().copied()
            };
            if let Some(status) = next {
                return Ok(status);
            }
        }
        state.machine_mut(uuid).map(|m| m.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DrpProvider;
    use serde_json::json;
    use std::sync::Arc;

    fn tester() -> ProviderTester<DrpProvider> {
        ProviderTester::new(DrpProvider::with_api(Arc::new(MemoryDrp::new())))
    }

    #[tokio::test]
    async fn test_tester_schema() {
        let tester = tester();
        assert!(tester.schema().resources.contains_key("drp_pool"));
        assert_eq!(
            tester.resource_types(),
            vec!["drp_instance", "drp_pool", "drp_profile_param"]
        );
    }

    #[tokio::test]
    async fn test_tester_validate_provider_config() {
        let tester = tester();
        assert!(tester
            .validate_provider_config(json!({"token": "t0k", "endpoint": "https://drp:8092"}))
            .await
            .is_ok());

        let err = tester
            .validate_provider_config(json!({"token": "t0k", "endpoint": "ftp://drp"}))
            .await
            .unwrap_err();
        match err {
            TestError::Diagnostics(diags) => assert_error_contains(&diags, "scheme"),
            other => panic!("unexpected {}", other),
        }
    }

    #[tokio::test]
    async fn test_tester_plan_update() {
        let tester = tester();
        let plan = tester
            .plan_update(
                "drp_pool",
                json!({"id": "edge", "pool_id": "edge", "description": "old"}),
                json!({"pool_id": "edge", "description": "new"}),
            )
            .await
            .unwrap();

        assert_plan_changes_attribute(&plan, "description");
        assert_plan_updates_in_place(&plan);
        assert_eq!(plan.planned_state["id"], "edge");
    }

    #[tokio::test]
    async fn test_tester_lifecycle_create() {
        let tester = tester();
        let state = tester
            .lifecycle_create("drp_profile_param", json!({"profile": "global", "name": "ntp", "value": "a"}))
            .await
            .unwrap();

        assert_eq!(state["id"], "global/ntp");
        assert_eq!(state["value"], "a");
    }

    #[tokio::test]
    async fn test_memory_drp_status_script() {
        let drp = MemoryDrp::new()
            .with_machine(Machine {
                uuid: "m1".to_string(),
                pool_status: "Free".to_string(),
                ..Default::default()
            })
            .with_status_script("m1", vec![MachineStatus::Allocated, MachineStatus::Deployed]);

        assert_eq!(drp.machine_status("m1").await.unwrap(), MachineStatus::Allocated);
        assert_eq!(drp.machine_status("m1").await.unwrap(), MachineStatus::Deployed);
        assert_eq!(drp.machine_status("m1").await.unwrap(), MachineStatus::Deployed);

        drp.script_status("m1", vec![]).await;
        assert_eq!(drp.machine_status("m1").await.unwrap(), MachineStatus::Ready);
        assert!(drp.machine_status("m2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memory_drp_allocation() {
        let free = |uuid: &str| Machine {
            uuid: uuid.to_string(),
            pool: "default".to_string(),
            pool_status: "Free".to_string(),
            ..Default::default()
        };
        let drp = MemoryDrp::new().with_machine(free("m1")).with_machine(free("m2"));
        let request = AllocationRequest::single(vec![]);

        assert_eq!(drp.allocate_machine("default", &request).await.unwrap().uuid, "m1");
        assert_eq!(drp.allocate_machine("default", &request).await.unwrap().uuid, "m2");
        assert!(matches!(
            drp.allocate_machine("default", &request).await,
            Err(ProviderError::ResourceExhausted(_))
        ));

        drp.release_machine("default", "m1").await.unwrap();
        assert_eq!(drp.allocate_machine("default", &request).await.unwrap().uuid, "m1");
        assert_eq!(drp.calls().await.len(), 5);
    }

    #[test]
    fn test_assert_no_errors() {
        let diagnostics = vec![Diagnostic::warning("Just a warning")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    #[should_panic(expected = "Expected no errors")]
    fn test_assert_no_errors_fails() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    #[should_panic(expected = "Expected plan to require replacement")]
    fn test_assert_plan_replaces_fails() {
        assert_plan_replaces(&PlanResult::no_change(json!({})));
    }

    #[test]
    fn test_test_error_display() {
        let err = TestError::Diagnostics(vec![
            Diagnostic::error("First error").with_attribute("field1"),
            Diagnostic::error("Second error").with_detail("More info"),
        ]);

        let display = format!("{}", err);
        assert!(display.contains("First error"));
        assert!(display.contains("Second error"));
        assert!(display.contains("field1"));
        assert!(display.contains("More info"));
    }
}
