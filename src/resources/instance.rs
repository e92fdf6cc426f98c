//! `drp_instance`: a machine allocated from a pool and deployed.
//!
//! Create does not make a machine. It allocates a free one from the pool,
//! stamps the requested name/profiles/params on it, powers it on and waits
//! for its workflow to finish. Delete hands the machine back and waits until
//! the pool reports it free again.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::{into_object, set_string, string_attr, string_list, Resource};
use crate::client::models::{AllocationRequest, Machine};
use crate::client::DrpApi;
use crate::error::ProviderError;
use crate::poller::{wait_for_state, Observation, PollConfig, PollError};
use crate::schema::{Attribute, Block, NestedBlock, Schema};
use crate::status::MachineStatus;

/// Pool used when the configuration names none.
pub const DEFAULT_POOL: &str = "default";

/// Machine action that starts a deploy.
pub const POWER_ON_ACTION: &str = "poweron";

const DEPLOY_TIMEOUT: Duration = Duration::from_secs(25 * 60);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const POLL_DELAY: Duration = Duration::from_secs(10);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Wait used after power-on.
pub fn deploy_wait() -> PollConfig<MachineStatus> {
    PollConfig::new(
        vec![MachineStatus::Allocated, MachineStatus::Deploying],
        vec![MachineStatus::Deployed],
        DEPLOY_TIMEOUT,
    )
    .with_delay(POLL_DELAY)
    .with_min_poll_interval(MIN_POLL_INTERVAL)
}

/// Wait used after release.
pub fn release_wait() -> PollConfig<MachineStatus> {
    PollConfig::new(
        vec![MachineStatus::Deployed, MachineStatus::Releasing],
        vec![MachineStatus::Ready],
        RELEASE_TIMEOUT,
    )
    .with_delay(POLL_DELAY)
    .with_min_poll_interval(MIN_POLL_INTERVAL)
}

/// Collapse runs of whitespace; `None` if nothing is left.
fn normalize_whitespace(value: &str) -> Option<String> {
    let joined = value.split_whitespace().collect::<Vec<_>>().join(" ");
    (!joined.is_empty()).then_some(joined)
}

/// What the configuration asks of the allocated machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    /// Machine name.
    pub name: Option<String>,
    /// Boot environment.
    pub bootenv: Option<String>,
    /// Recorded as the `owner` meta field.
    pub owner: Option<String>,
    /// Machine description.
    pub description: Option<String>,
    /// Profiles to attach.
    pub profiles: Vec<String>,
    /// Params to set, as `(name, value)`.
    pub parameters: Vec<(String, String)>,
    /// Allocation filters, as `name=value`.
    pub filters: Vec<String>,
}

fn name_value_pairs(state: &Value, block: &str) -> Result<Vec<(String, String)>, ProviderError> {
    let Some(items) = state.get(block).and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let name = string_attr(item, "name").ok_or_else(|| {
                ProviderError::Validation(format!("{}.{}.name is required", block, i))
            })?;
            let value = item.get("value").and_then(Value::as_str).unwrap_or_default();
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

impl Constraints {
    /// Read the constraints from resource state.
    pub fn from_state(state: &Value) -> Result<Self, ProviderError> {
        let text = |name: &str| string_attr(state, name).and_then(normalize_whitespace);

        Ok(Self {
            name: text("name"),
            bootenv: text("bootenv"),
            owner: text("owner"),
            description: text("description"),
            profiles: string_list(state, "profiles"),
            parameters: name_value_pairs(state, "parameters")?,
            filters: name_value_pairs(state, "filters")?
                .into_iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect(),
        })
    }

    /// Write the constraints onto `machine`. Param values that parse as JSON
    /// are stored as JSON, anything else as a string.
    pub fn apply(&self, machine: &mut Machine) {
        if let Some(name) = &self.name {
            machine.name = name.clone();
        }
        if let Some(description) = &self.description {
            machine.description = description.clone();
        }
        if let Some(bootenv) = &self.bootenv {
            machine.boot_env = bootenv.clone();
        }
        if let Some(owner) = &self.owner {
            machine.meta.insert("owner".to_string(), owner.clone());
        }
        for profile in &self.profiles {
            if !machine.profiles.contains(profile) {
                machine.profiles.push(profile.clone());
            }
        }
        for (name, raw) in &self.parameters {
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            machine.params.insert(name.clone(), value);
        }
    }
}

/// Poll a machine's status. A machine that disappears while waiting is
/// reported as [`MachineStatus::Missing`] when `missing_is_done` is set.
async fn wait_for_machine(
    api: &dyn DrpApi,
    uuid: &str,
    config: &PollConfig<MachineStatus>,
    missing_is_done: bool,
) -> Result<MachineStatus, PollError<MachineStatus, ProviderError>> {
    wait_for_state(config, move || async move {
        match api.machine_status(uuid).await {
            Ok(status) => {
                debug!(uuid, status = %status, "machine status");
                Ok(Observation::new(status))
            },
            Err(err) if missing_is_done && err.is_not_found() => {
                Ok(Observation::done(MachineStatus::Missing))
            },
            Err(err) => Err(err),
        }
    })
    .await
}

/// Release a machine after a failed create. Failures are logged, not returned.
async fn release_after_failure(api: &dyn DrpApi, pool: &str, uuid: &str) {
    match api.release_machine(pool, uuid).await {
        Ok(()) => info!(uuid, pool, "released machine after failed create"),
        Err(err) => error!(uuid, pool, error = %err, "unable to release machine"),
    }
}

fn wait_error(err: PollError<MachineStatus, ProviderError>, context: String) -> ProviderError {
    match ProviderError::from(err) {
        ProviderError::DeadlineExceeded(msg) => {
            ProviderError::DeadlineExceeded(format!("{}: {}", context, msg))
        },
        ProviderError::FailedPrecondition(msg) => {
            ProviderError::FailedPrecondition(format!("{}: {}", context, msg))
        },
        other => other,
    }
}

/// Refresh a free-text attribute from the machine. An attribute left unset
/// stays unset, and a value matching the machine's up to whitespace keeps
/// the configured spelling.
fn refresh_text(state: &mut Map<String, Value>, name: &str, remote: &str) {
    let Some(configured) = state.get(name).and_then(Value::as_str) else {
        return;
    };
    if normalize_whitespace(configured) != normalize_whitespace(remote) {
        set_string(state, name, remote);
    }
}

fn machine_uuid(state: &Value) -> Result<&str, ProviderError> {
    string_attr(state, "id")
        .or_else(|| string_attr(state, "uuid"))
        .ok_or_else(|| ProviderError::InvalidRequest("instance state has no id".to_string()))
}

fn pool_name(state: &Value) -> &str {
    string_attr(state, "pool").unwrap_or(DEFAULT_POOL)
}

/// The `drp_instance` resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceResource;

#[async_trait]
impl Resource for InstanceResource {
    fn type_name(&self) -> &'static str {
        "drp_instance"
    }

    fn schema(&self) -> Schema {
        let name_value = || {
            NestedBlock::list(
                Block::new()
                    .with_attribute("name", Attribute::optional_string())
                    .with_attribute("value", Attribute::optional_string()),
            )
            .with_force_new()
        };

        Schema::new(1)
            .with_description("A machine allocated from a DRP pool and deployed")
            .with_attribute(
                "pool",
                Attribute::optional_string()
                    .with_description("Pool to allocate from")
                    .with_default(json!(DEFAULT_POOL))
                    .with_force_new(),
            )
            .with_attribute("name", Attribute::optional_string().with_force_new())
            .with_attribute("bootenv", Attribute::optional_string().with_force_new())
            .with_attribute("owner", Attribute::optional_string().with_force_new())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute(
                "profiles",
                Attribute::optional_string_list().with_force_new(),
            )
            .with_attribute("id", Attribute::computed_string())
            .with_attribute(
                "uuid",
                Attribute::computed_string().with_description("Machine UUID"),
            )
            .with_attribute(
                "status",
                Attribute::computed_string().with_description("Status as <code>:<Name>"),
            )
            .with_block("parameters", name_value())
            .with_block("filters", name_value())
    }

    fn upgrade_state(&self, version: i64, state: Value) -> Result<Value, ProviderError> {
        if version >= 1 {
            return Ok(state);
        }
        let mut state = into_object(state)?;
        let has_pool = state
            .get("pool")
            .and_then(Value::as_str)
            .is_some_and(|pool| !pool.is_empty());
        if !has_pool {
            debug!("upgrading instance state to version 1");
            state.insert("pool".to_string(), json!(DEFAULT_POOL));
        }
        Ok(Value::Object(state))
    }

    async fn create(&self, api: &dyn DrpApi, planned: Value) -> Result<Value, ProviderError> {
        let pool = pool_name(&planned).to_string();
        let constraints = Constraints::from_state(&planned)?;

        let mut machine = api
            .allocate_machine(&pool, &AllocationRequest::single(constraints.filters.clone()))
            .await?;
        let uuid = machine.uuid.clone();
        info!(uuid = %uuid, pool = %pool, "allocated machine");

        constraints.apply(&mut machine);
        if let Err(err) = api.update_machine(&machine).await {
            error!(uuid = %uuid, error = %err, "unable to initialize machine");
            release_after_failure(api, &pool, &uuid).await;
            return Err(err);
        }

        if let Err(err) = api.machine_action(&uuid, POWER_ON_ACTION).await {
            error!(uuid = %uuid, error = %err, "unable to power on machine");
            release_after_failure(api, &pool, &uuid).await;
            return Err(err);
        }

        debug!(uuid = %uuid, "waiting for machine to deploy");
        if let Err(err) = wait_for_machine(api, &uuid, &deploy_wait(), false).await {
            if err.warrants_cleanup() {
                release_after_failure(api, &pool, &uuid).await;
            }
            return Err(wait_error(
                err,
                format!("waiting for instance {} to become deployed", uuid),
            ));
        }
        info!(uuid = %uuid, "machine deployed");

        let mut state = into_object(planned)?;
        state.insert("pool".to_string(), json!(pool));
        state.insert("id".to_string(), json!(uuid));
        state.insert("uuid".to_string(), json!(uuid));
        self.read(api, Value::Object(state)).await
    }

    async fn read(&self, api: &dyn DrpApi, current: Value) -> Result<Value, ProviderError> {
        let machine = api.get_machine(machine_uuid(&current)?).await?;

        let mut state = into_object(current)?;
        state.insert("id".to_string(), json!(machine.uuid));
        state.insert("uuid".to_string(), json!(machine.uuid));
        state.insert("status".to_string(), json!(machine.status().to_string()));
        refresh_text(&mut state, "name", &machine.name);
        refresh_text(&mut state, "description", &machine.description);
        if !machine.pool.is_empty() {
            state.insert("pool".to_string(), json!(machine.pool));
        }
        Ok(Value::Object(state))
    }

    async fn update(
        &self,
        api: &dyn DrpApi,
        _prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let uuid = machine_uuid(&planned)?;
        let mut machine = api.get_machine(uuid).await?;
        machine.description = string_attr(&planned, "description")
            .and_then(normalize_whitespace)
            .unwrap_or_default();
        api.update_machine(&machine).await?;
        info!(uuid, "updated machine description");
        self.read(api, planned).await
    }

    async fn delete(&self, api: &dyn DrpApi, current: Value) -> Result<(), ProviderError> {
        let uuid = machine_uuid(&current)?;
        let pool = pool_name(&current);

        match api.release_machine(pool, uuid).await {
            Ok(()) => {},
            Err(err) if err.is_not_found() => {
                warn!(uuid, pool, "machine already gone");
                return Ok(());
            },
            Err(err) => return Err(err),
        }

        let status = wait_for_machine(api, uuid, &release_wait(), true)
            .await
            .map_err(|err| {
                wait_error(err, format!("waiting for instance {} to become ready", uuid))
            })?;
        info!(uuid, pool, status = %status, "machine released");
        Ok(())
    }

    async fn import(&self, api: &dyn DrpApi, id: &str) -> Result<Value, ProviderError> {
        let machine = api.get_machine(id).await?;
        let mut state = Map::new();
        state.insert("id".to_string(), json!(id));
        set_string(&mut state, "name", &machine.name);
        set_string(&mut state, "description", &machine.description);
        self.read(api, Value::Object(state)).await
    }
}
