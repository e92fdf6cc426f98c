//! Validation of JSON configuration against a [`Schema`].
//!
//! Checks required attributes, value types, nested block item counts and
//! exactly-one-of groups. Every diagnostic carries the dotted path of the
//! offending attribute, e.g. `allocate_actions.0.workflow`.
//!
//! ```ignore
//! let diagnostics = validate(&schema, &config);
//! if has_errors(&diagnostics) {
//!     return Ok(diagnostics);
//! }
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

use crate::schema::{
    Attribute, AttributeType, Block, BlockNestingMode, Diagnostic, NestedBlock, Schema,
};

/// Validate `value` against `schema`.
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    if let Value::Object(obj) = value {
        for group in &schema.exactly_one_of {
            validate_exactly_one_of(group, obj, &mut diagnostics);
        }
    }
    diagnostics
}

/// Whether an attribute counts as set. Empty strings count as unset, the way
/// the host reports cleared optional strings.
pub fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn validate_exactly_one_of(
    group: &[String],
    obj: &serde_json::Map<String, Value>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let set: Vec<&String> = group
        .iter()
        .filter(|name| is_set(obj.get(name.as_str())))
        .collect();
    if set.len() == 1 {
        return;
    }

    let names = group.join(", ");
    let diagnostic = if set.is_empty() {
        Diagnostic::error(format!("One of {} must be set", names))
    } else {
        Diagnostic::error(format!("Only one of {} may be set", names)).with_detail(format!(
            "got {}",
            set.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        ))
    };
    let attribute = set.first().copied().or_else(|| group.first());
    diagnostics.push(match attribute {
        Some(attribute) => diagnostic.with_attribute(attribute.clone()),
        None => diagnostic,
    });
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            let diag = Diagnostic::error("Expected object")
                .with_detail(format!("Got {}", value_type_name(value)));
            diagnostics.push(if path.is_empty() {
                diag
            } else {
                diag.with_attribute(path)
            });
            return;
        },
    };

    for (name, attr) in &block.attributes {
        validate_attribute(attr, obj.get(name), &join_path(path, name), diagnostics);
    }

    for (name, nested) in &block.blocks {
        validate_nested_block(nested, obj.get(name), &join_path(path, name), diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Computed-only attributes are set by the provider.
    if attr.flags.computed && !attr.flags.optional && !attr.flags.required {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => validate_attribute_type(&attr.attr_type, v, path, diagnostics),
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String if !value.is_string() => {
            diagnostics.push(type_error(path, "string", value))
        },
        AttributeType::Int64 if !(value.is_i64() || value.is_u64()) => {
            diagnostics.push(type_error(path, "int64", value))
        },
        AttributeType::Bool if !value.is_boolean() => {
            diagnostics.push(type_error(path, "bool", value))
        },
        AttributeType::List(element_type) => match value.as_array() {
            Some(arr) => {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            },
            None => diagnostics.push(type_error(path, "list", value)),
        },
        AttributeType::Map(value_type) => match value.as_object() {
            Some(obj) => {
                for (key, val) in obj {
                    let key_path = format!("{}.{}", path, key);
                    validate_attribute_type(value_type, val, &key_path, diagnostics);
                }
            },
            None => diagnostics.push(type_error(path, "map", value)),
        },
        AttributeType::Object(attrs) => match value.as_object() {
            Some(obj) => validate_object_type(attrs, obj, path, diagnostics),
            None => diagnostics.push(type_error(path, "object", value)),
        },
        _ => {},
    }
}

fn validate_object_type(
    attrs: &BTreeMap<String, AttributeType>,
    obj: &serde_json::Map<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Object members have no presence flags, only types.
    for (name, attr_type) in attrs {
        if let Some(value) = obj.get(name).filter(|v| !v.is_null()) {
            validate_attribute_type(attr_type, value, &join_path(path, name), diagnostics);
        }
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let value = match value {
        None | Some(Value::Null) => return,
        Some(v) => v,
    };

    match (nested.nesting_mode, value) {
        (BlockNestingMode::Single, v) => validate_block(&nested.block, v, path, diagnostics),
        (BlockNestingMode::List | BlockNestingMode::Set, Value::Array(items)) => {
            check_item_count(nested, items.len(), path, diagnostics);
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{}.{}", path, i);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        (BlockNestingMode::Map, Value::Object(items)) => {
            check_item_count(nested, items.len(), path, diagnostics);
            for (key, item) in items {
                let item_path = format!("{}.{}", path, key);
                validate_block(&nested.block, item, &item_path, diagnostics);
            }
        },
        (mode, v) => {
            let expected = if mode == BlockNestingMode::Map {
                "map"
            } else {
                "list"
            };
            diagnostics.push(
                Diagnostic::error(format!("Expected {} for block '{}'", expected, path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

fn check_item_count(
    nested: &NestedBlock,
    len: usize,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let len = len as u32;
    // 0 means unlimited.
    if nested.max_items > 0 && len > nested.max_items {
        diagnostics.push(
            Diagnostic::error(format!(
                "Block '{}' allows at most {} item(s), got {}",
                path, nested.max_items, len
            ))
            .with_attribute(path),
        );
    }
}

fn type_error(path: &str, expected: &str, value: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(value)))
        .with_attribute(path)
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::has_errors;
    use serde_json::json;

    fn param_schema() -> Schema {
        Schema::v0()
            .with_attribute("profile", Attribute::required_string())
            .with_attribute("name", Attribute::required_string())
            .with_attribute("value", Attribute::optional_string())
            .with_attribute("secure_value", Attribute::optional_string().sensitive())
            .with_attribute("id", Attribute::computed_string())
            .with_exactly_one_of(&["value", "secure_value"])
    }

    fn pool_schema() -> Schema {
        Schema::v0()
            .with_attribute("pool_id", Attribute::required_string())
            .with_block(
                "allocate_actions",
                NestedBlock::list(
                    Block::new()
                        .with_attribute("workflow", Attribute::optional_string())
                        .with_attribute("remove_parameters", Attribute::optional_string_list()),
                )
                .with_max_items(1),
            )
            .with_block(
                "filters",
                NestedBlock::map(Block::new().with_attribute("value", Attribute::required_string())),
            )
    }

    #[test]
    fn test_valid_config() {
        let config = json!({"profile": "global", "name": "ntp-servers", "value": "10.0.0.1"});
        assert!(validate(&param_schema(), &config).is_empty());
    }

    #[test]
    fn test_missing_required() {
        let diags = validate(&param_schema(), &json!({"name": "x", "value": "y"}));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].attribute.as_deref(), Some("profile"));
    }

    #[test]
    fn test_exactly_one_of_neither() {
        let diags = validate(&param_schema(), &json!({"profile": "p", "name": "n"}));
        assert!(has_errors(&diags));
        assert!(diags[0].summary.contains("One of value, secure_value"));
    }

    #[test]
    fn test_exactly_one_of_both() {
        let diags = validate(
            &param_schema(),
            &json!({"profile": "p", "name": "n", "value": "a", "secure_value": "b"}),
        );
        assert_eq!(diags.len(), 1);
        assert!(diags[0].summary.starts_with("Only one of"));
    }

    #[test]
    fn test_empty_string_counts_as_unset() {
        let config = json!({"profile": "p", "name": "n", "value": "", "secure_value": "b"});
        assert!(validate(&param_schema(), &config).is_empty());
    }

    #[test]
    fn test_type_errors_carry_paths() {
        let diags = validate(
            &pool_schema(),
            &json!({
                "pool_id": 7,
                "allocate_actions": [{"workflow": "deploy", "remove_parameters": ["a", 1]}]
            }),
        );
        let paths: Vec<_> = diags.iter().filter_map(|d| d.attribute.as_deref()).collect();
        assert_eq!(paths, vec!["pool_id", "allocate_actions.0.remove_parameters.1"]);
    }

    #[test]
    fn test_max_items() {
        let diags = validate(
            &pool_schema(),
            &json!({
                "pool_id": "edge",
                "allocate_actions": [{"workflow": "a"}, {"workflow": "b"}]
            }),
        );
        assert_eq!(diags.len(), 1);
        assert!(diags[0].summary.contains("at most 1"));
    }

    #[test]
    fn test_wrong_block_shape() {
        let diags = validate(
            &pool_schema(),
            &json!({"pool_id": "edge", "allocate_actions": {"workflow": "a"}}),
        );
        assert!(diags[0].summary.starts_with("Expected list"));

        let diags = validate(&pool_schema(), &json!({"pool_id": "edge", "filters": []}));
        assert!(diags[0].summary.starts_with("Expected map"));
    }

    #[test]
    fn test_map_block_items_validated() {
        let diags = validate(
            &pool_schema(),
            &json!({"pool_id": "edge", "filters": {"arch": {}}}),
        );
        assert_eq!(diags[0].attribute.as_deref(), Some("filters.arch.value"));
    }

    #[test]
    fn test_object_type_members() {
        let schema = Schema::v0().with_attribute(
            "parameters",
            Attribute::new(
                AttributeType::list(AttributeType::string_object(["name", "value"])),
                crate::schema::AttributeFlags::optional(),
            ),
        );
        assert!(validate(&schema, &json!({"parameters": [{"name": "a", "value": null}]})).is_empty());
        let diags = validate(&schema, &json!({"parameters": [{"name": 1}]}));
        assert_eq!(diags[0].attribute.as_deref(), Some("parameters.0.name"));
    }

    #[test]
    fn test_non_object_root() {
        let diags = validate(&param_schema(), &json!("nope"));
        assert_eq!(diags.len(), 1);
        assert!(diags[0].attribute.is_none());
    }

    #[test]
    fn test_is_set() {
        assert!(!is_set(None));
        assert!(!is_set(Some(&Value::Null)));
        assert!(!is_set(Some(&json!(""))));
        assert!(is_set(Some(&json!("x"))));
        assert!(is_set(Some(&json!(0))));
    }
}
