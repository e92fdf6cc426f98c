//! `drp_pool`: a machine pool with its transition actions and autofill.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{required_string, set_string, string_attr, string_list, Resource};
use crate::client::models::{Pool, PoolAutoFill, PoolTransitionActions};
use crate::client::DrpApi;
use crate::error::ProviderError;
use crate::schema::{Attribute, Block, NestedBlock, Schema};

/// Blocks holding [`PoolTransitionActions`], in wire order.
const ACTION_BLOCKS: [&str; 4] = [
    "enter_actions",
    "exit_actions",
    "allocate_actions",
    "release_actions",
];

/// The `drp_pool` resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolResource;

fn actions_block(description: &str) -> NestedBlock {
    NestedBlock::list(
        Block::new()
            .with_description(description)
            .with_attribute(
                "workflow",
                Attribute::optional_string().with_description("Workflow to start"),
            )
            .with_attribute(
                "add_profiles",
                Attribute::optional_string_list().with_description("Profiles to add"),
            )
            .with_attribute(
                "add_parameters",
                Attribute::optional_string_map()
                    .with_description("Parameters to set, values JSON encoded"),
            )
            .with_attribute(
                "remove_profiles",
                Attribute::optional_string_list().with_description("Profiles to remove"),
            )
            .with_attribute(
                "remove_parameters",
                Attribute::optional_string_list().with_description("Parameters to remove"),
            ),
    )
    .with_max_items(1)
}

fn autofill_block() -> NestedBlock {
    NestedBlock::list(
        Block::new()
            .with_description("Automatic acquisition and return of machines")
            .with_attribute("acquire_pool", Attribute::optional_string())
            .with_attribute("return_pool", Attribute::optional_string())
            .with_attribute("max_free", Attribute::optional_int64())
            .with_attribute("min_free", Attribute::optional_int64())
            .with_attribute(
                "create_parameters",
                Attribute::optional_string_map()
                    .with_description("Parameters for created machines, values JSON encoded"),
            ),
    )
    .with_max_items(1)
}

/// First element of a list block, or the block itself if sent as an object.
fn block_item<'a>(state: &'a Value, name: &str) -> Option<&'a Value> {
    match state.get(name)? {
        Value::Array(items) => items.first().filter(|item| item.is_object()),
        item @ Value::Object(_) => Some(item),
        _ => None,
    }
}

fn parse_json_map(
    item: &Value,
    name: &str,
    block: &str,
) -> Result<BTreeMap<String, Value>, ProviderError> {
    let Some(entries) = item.get(name).and_then(Value::as_object) else {
        return Ok(BTreeMap::new());
    };
    entries
        .iter()
        .map(|(key, raw)| {
            let raw = raw.as_str().unwrap_or_default();
            serde_json::from_str(raw)
                .map(|value| (key.clone(), value))
                .map_err(|err| {
                    ProviderError::Validation(format!(
                        "{}.{}[\"{}\"] is not valid JSON: {}",
                        block, name, key, err
                    ))
                })
        })
        .collect()
}

fn encode_json_map(entries: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        entries
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.to_string())))
            .collect(),
    )
}

/// Whether `raw` and the encoded `current` hold the same JSON value.
fn same_json(raw: &str, current: &Value) -> bool {
    let Some(current) = current.as_str() else {
        return false;
    };
    match (
        serde_json::from_str::<Value>(raw),
        serde_json::from_str::<Value>(current),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Put back the configured spelling of JSON-encoded parameter values DRP
/// still holds, so reformatting alone is not a change.
fn keep_configured_json(mut refreshed: Value, configured: &Value) -> Value {
    let maps = ACTION_BLOCKS
        .iter()
        .map(|block| (*block, "add_parameters"))
        .chain([("autofill", "create_parameters")]);

    for (block, map) in maps {
        let Some(before) = block_item(configured, block)
            .and_then(|item| item.get(map))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let Some(after) = refreshed
            .get_mut(block)
            .and_then(|items| items.get_mut(0))
            .and_then(|item| item.get_mut(map))
            .and_then(Value::as_object_mut)
        else {
            continue;
        };
        for (key, encoded) in after.iter_mut() {
            if let Some(raw) = before.get(key).and_then(Value::as_str) {
                if same_json(raw, encoded) {
                    *encoded = Value::String(raw.to_string());
                }
            }
        }
    }
    refreshed
}

fn actions_from_state(item: &Value, block: &str) -> Result<PoolTransitionActions, ProviderError> {
    Ok(PoolTransitionActions {
        workflow: string_attr(item, "workflow").unwrap_or_default().to_string(),
        add_profiles: string_list(item, "add_profiles"),
        add_parameters: parse_json_map(item, "add_parameters", block)?,
        remove_profiles: string_list(item, "remove_profiles"),
        remove_parameters: string_list(item, "remove_parameters"),
    })
}

fn actions_to_state(actions: &PoolTransitionActions) -> Value {
    let mut item = Map::new();
    set_string(&mut item, "workflow", &actions.workflow);
    if !actions.add_profiles.is_empty() {
        item.insert("add_profiles".into(), json!(actions.add_profiles));
    }
    if !actions.add_parameters.is_empty() {
        item.insert(
            "add_parameters".into(),
            encode_json_map(&actions.add_parameters),
        );
    }
    if !actions.remove_profiles.is_empty() {
        item.insert("remove_profiles".into(), json!(actions.remove_profiles));
    }
    if !actions.remove_parameters.is_empty() {
        item.insert(
            "remove_parameters".into(),
            json!(actions.remove_parameters),
        );
    }
    Value::Object(item)
}

fn int_field(item: &Value, name: &str) -> Result<i32, ProviderError> {
    match item.get(name).and_then(Value::as_i64) {
        None => Ok(0),
        Some(n) => i32::try_from(n).map_err(|_| {
            ProviderError::Validation(format!("autofill.{} is out of range: {}", name, n))
        }),
    }
}

fn autofill_from_state(item: &Value) -> Result<PoolAutoFill, ProviderError> {
    Ok(PoolAutoFill {
        use_auto_fill: true,
        acquire_pool: string_attr(item, "acquire_pool")
            .unwrap_or_default()
            .to_string(),
        return_pool: string_attr(item, "return_pool")
            .unwrap_or_default()
            .to_string(),
        max_free: int_field(item, "max_free")?,
        min_free: int_field(item, "min_free")?,
        create_parameters: parse_json_map(item, "create_parameters", "autofill")?,
    })
}

fn autofill_to_state(auto_fill: &PoolAutoFill) -> Value {
    let mut item = Map::new();
    set_string(&mut item, "acquire_pool", &auto_fill.acquire_pool);
    set_string(&mut item, "return_pool", &auto_fill.return_pool);
    // Zero is DRP's unset value.
    if auto_fill.max_free != 0 {
        item.insert("max_free".into(), json!(auto_fill.max_free));
    }
    if auto_fill.min_free != 0 {
        item.insert("min_free".into(), json!(auto_fill.min_free));
    }
    if !auto_fill.create_parameters.is_empty() {
        item.insert(
            "create_parameters".into(),
            encode_json_map(&auto_fill.create_parameters),
        );
    }
    Value::Object(item)
}

/// Build the DRP pool described by resource state.
pub fn pool_from_state(state: &Value) -> Result<Pool, ProviderError> {
    let actions = |block: &str| {
        block_item(state, block)
            .map(|item| actions_from_state(item, block))
            .transpose()
    };

    Ok(Pool {
        id: required_string(state, "pool_id")?.to_string(),
        description: string_attr(state, "description")
            .unwrap_or_default()
            .to_string(),
        documentation: string_attr(state, "documentation")
            .unwrap_or_default()
            .to_string(),
        parent_pool: string_attr(state, "parent_pool")
            .unwrap_or_default()
            .to_string(),
        enter_actions: actions("enter_actions")?,
        exit_actions: actions("exit_actions")?,
        allocate_actions: actions("allocate_actions")?,
        release_actions: actions("release_actions")?,
        auto_fill: block_item(state, "autofill")
            .map(autofill_from_state)
            .transpose()?,
    })
}

/// Resource state for a DRP pool.
pub fn state_from_pool(pool: &Pool) -> Value {
    let mut state = Map::new();
    state.insert("id".into(), json!(pool.id));
    state.insert("pool_id".into(), json!(pool.id));
    set_string(&mut state, "description", &pool.description);
    set_string(&mut state, "documentation", &pool.documentation);
    set_string(&mut state, "parent_pool", &pool.parent_pool);

    let actions = [
        &pool.enter_actions,
        &pool.exit_actions,
        &pool.allocate_actions,
        &pool.release_actions,
    ];
    for (block, actions) in ACTION_BLOCKS.into_iter().zip(actions) {
        if let Some(actions) = actions {
            state.insert(block.into(), json!([actions_to_state(actions)]));
        }
    }
    if let Some(auto_fill) = pool.auto_fill.as_ref().filter(|a| a.use_auto_fill) {
        state.insert("autofill".into(), json!([autofill_to_state(auto_fill)]));
    }
    Value::Object(state)
}

fn pool_id(state: &Value) -> Result<&str, ProviderError> {
    string_attr(state, "id")
        .or_else(|| string_attr(state, "pool_id"))
        .ok_or_else(|| ProviderError::InvalidRequest("pool state has no id".to_string()))
}

#[async_trait]
impl Resource for PoolResource {
    fn type_name(&self) -> &'static str {
        "drp_pool"
    }

    fn schema(&self) -> Schema {
        let mut schema = Schema::v0()
            .with_description("A DRP machine pool")
            .with_attribute(
                "pool_id",
                Attribute::required_string()
                    .with_description("Pool name")
                    .with_force_new(),
            )
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("documentation", Attribute::optional_string())
            .with_attribute(
                "parent_pool",
                Attribute::optional_string().with_description("Pool this pool is nested under"),
            )
            .with_attribute("id", Attribute::computed_string())
            .with_block("autofill", autofill_block());

        for block in ACTION_BLOCKS {
            let description = format!("Actions applied on {}", block.replace('_', " "));
            schema = schema.with_block(block, actions_block(&description));
        }
        schema
    }

    async fn create(&self, api: &dyn DrpApi, planned: Value) -> Result<Value, ProviderError> {
        let pool = pool_from_state(&planned)?;
        debug!(pool = %pool.id, "creating pool");
        let created = api.create_pool(&pool).await?;
        info!(pool = %created.id, "created pool");
        Ok(keep_configured_json(state_from_pool(&created), &planned))
    }

    async fn read(&self, api: &dyn DrpApi, current: Value) -> Result<Value, ProviderError> {
        let pool = api.get_pool(pool_id(&current)?).await?;
        Ok(keep_configured_json(state_from_pool(&pool), &current))
    }

    async fn update(
        &self,
        api: &dyn DrpApi,
        _prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let pool = pool_from_state(&planned)?;
        let updated = api.update_pool(&pool).await?;
        info!(pool = %updated.id, "updated pool");
        Ok(keep_configured_json(state_from_pool(&updated), &planned))
    }

    async fn delete(&self, api: &dyn DrpApi, current: Value) -> Result<(), ProviderError> {
        let id = pool_id(&current)?;
        api.delete_pool(id).await?;
        info!(pool = id, "deleted pool");
        Ok(())
    }

    async fn import(&self, api: &dyn DrpApi, id: &str) -> Result<Value, ProviderError> {
        self.read(api, json!({ "id": id, "pool_id": id })).await
    }
}
