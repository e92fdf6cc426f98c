//! Top-level diff between prior and proposed state.
//!
//! The planner only looks at the root attributes and blocks of a schema:
//! nested values are compared as a whole. Blank values (`null`, `""`, `[]`,
//! `{}`) compare equal to a missing attribute, at any depth, so a refreshed
//! state that reports `""` for an unset description is not a change.

use serde_json::{Map, Value};

use crate::schema::Schema;
use crate::types::{AttributeChange, PlanResult};

/// Drop blank members recursively; `None` if the whole value is blank.
fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| normalize(item).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Object(members) => {
            let members: Map<String, Value> = members
                .iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k.clone(), v)))
                .collect();
            if members.is_empty() {
                None
            } else {
                Some(Value::Object(members))
            }
        },
        other => Some(other.clone()),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    value.and_then(normalize).is_none()
}

/// Plan a change to a resource of the given schema.
///
/// `prior` is `None` on create; a `null` `proposed` plans a destroy.
pub fn plan_resource(schema: &Schema, prior: Option<&Value>, proposed: Value) -> PlanResult {
    let prior_obj = prior.and_then(Value::as_object);

    if proposed.is_null() {
        let changes = prior_obj
            .map(|obj| {
                obj.iter()
                    .filter(|(_, v)| !is_blank(Some(v)))
                    .map(|(k, v)| AttributeChange::removed(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        return PlanResult::with_changes(Value::Null, changes, false);
    }

    let mut planned: Map<String, Value> = match proposed {
        Value::Object(map) => map,
        other => return PlanResult::no_change(other),
    };

    for (name, attr) in &schema.block.attributes {
        if !is_blank(planned.get(name)) {
            continue;
        }
        if let Some(default) = &attr.default {
            planned.insert(name.clone(), default.clone());
        } else if attr.flags.computed {
            // Unknown on create, unchanged on update.
            if let Some(previous) = prior_obj.and_then(|p| p.get(name)) {
                planned.insert(name.clone(), previous.clone());
            }
        }
    }

    let names = schema
        .block
        .attributes
        .keys()
        .chain(schema.block.blocks.keys());

    let mut changes = Vec::new();
    let mut requires_replace = false;
    for name in names {
        let before = prior_obj.and_then(|p| p.get(name)).and_then(normalize);
        let after = planned.get(name).and_then(normalize);
        if before == after {
            continue;
        }
        if prior_obj.is_some() && schema.forces_new(name) {
            requires_replace = true;
        }
        changes.push(AttributeChange::new(name.clone(), before, after));
    }

    PlanResult::with_changes(Value::Object(planned), changes, requires_replace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Block, NestedBlock};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1)
            .with_attribute(
                "pool",
                Attribute::optional_string()
                    .with_force_new()
                    .with_default(json!("default")),
            )
            .with_attribute("name", Attribute::optional_string().with_force_new())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("status", Attribute::computed_string())
            .with_block(
                "filters",
                NestedBlock::list(Block::new().with_attribute("name", Attribute::optional_string()))
                    .with_force_new(),
            )
    }

    #[test]
    fn test_create_applies_defaults() {
        let plan = plan_resource(&schema(), None, json!({"name": "node-1"}));

        assert_eq!(plan.planned_state["pool"], "default");
        assert!(plan.planned_state.get("id").is_none());
        assert!(!plan.requires_replace);

        let paths: Vec<_> = plan.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["name", "pool"]);
    }

    #[test]
    fn test_no_change_keeps_computed() {
        let prior = json!({
            "pool": "default", "name": "node-1", "description": "",
            "id": "m1", "status": "6:Deployed", "filters": []
        });
        let plan = plan_resource(&schema(), Some(&prior), json!({"name": "node-1"}));

        assert!(plan.changes.is_empty());
        assert_eq!(plan.planned_state["id"], "m1");
        assert_eq!(plan.planned_state["status"], "6:Deployed");
    }

    #[test]
    fn test_in_place_update() {
        let prior = json!({"pool": "default", "name": "node-1", "id": "m1"});
        let plan = plan_resource(
            &schema(),
            Some(&prior),
            json!({"name": "node-1", "description": "web"}),
        );

        assert!(!plan.requires_replace);
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].path, "description");
        assert_eq!(plan.changes[0].before, None);
        assert_eq!(plan.changes[0].after, Some(json!("web")));
    }

    #[test]
    fn test_force_new_attribute_and_block() {
        let prior = json!({"pool": "default", "name": "node-1", "id": "m1"});

        let plan = plan_resource(&schema(), Some(&prior), json!({"name": "node-2"}));
        assert!(plan.requires_replace);

        let plan = plan_resource(
            &schema(),
            Some(&prior),
            json!({"name": "node-1", "filters": [{"name": "Arch=amd64"}]}),
        );
        assert!(plan.requires_replace);
    }

    #[test]
    fn test_nested_blanks_ignored() {
        let prior = json!({
            "pool": "default", "name": "node-1", "id": "m1",
            "filters": [{"name": "Arch=amd64"}]
        });
        let plan = plan_resource(
            &schema(),
            Some(&prior),
            json!({"name": "node-1", "filters": [{"name": "Arch=amd64", "value": null}]}),
        );
        assert!(plan.changes.is_empty());
        assert!(!plan.requires_replace);
    }

    #[test]
    fn test_destroy() {
        let prior = json!({"pool": "default", "id": "m1", "description": ""});
        let plan = plan_resource(&schema(), Some(&prior), Value::Null);

        assert!(plan.planned_state.is_null());
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes.iter().all(|c| c.after.is_none()));
    }
}
