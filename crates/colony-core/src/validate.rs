//! Task admission validation.
//!
//! [`validate`] is a pure function of its input. It never stops at the first
//! problem: every violation is collected so the caller sees the full list.

use crate::task::{
    ActionSpec, CombatStyle, Priority, RecipeIngredient, Target, TaskAction, TaskRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of `details`, in characters, after trimming.
pub const MAX_DETAILS_LEN: usize = 500;

/// Result of validating a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate a task request against the admission contract.
pub fn validate(request: &TaskRequest) -> Validation {
    match check(request) {
        Ok(_) => Validation {
            valid: true,
            errors: Vec::new(),
        },
        Err(errors) => Validation {
            valid: false,
            errors,
        },
    }
}

/// The typed pieces of a request that passed validation.
pub(crate) struct Checked {
    pub action: TaskAction,
    pub details: String,
    pub target: Option<Target>,
    pub priority: Priority,
    pub spec: ActionSpec,
}

pub(crate) fn check(request: &TaskRequest) -> Result<Checked, Vec<String>> {
    let mut errors = Vec::new();

    let action = check_action(&request.action, &mut errors);
    let details = check_details(&request.details, &mut errors);
    let target = request
        .target
        .as_ref()
        .and_then(|t| check_target(t, &mut errors));

    let priority = match request.priority.as_deref() {
        None => Some(Priority::default()),
        Some(tag) => {
            let parsed = Priority::parse(tag);
            if parsed.is_none() {
                errors.push(format!(
                    "priority '{tag}' must be one of: low, normal, high"
                ));
            }
            parsed
        }
    };

    if let Some(roles) = &request.preferred_agent_roles {
        if roles.iter().any(|r| r.trim().is_empty()) {
            errors.push("preferredAgentRoles entries must be non-empty strings".to_string());
        }
    }

    if let Some(plan) = request.metadata.get("plan") {
        if !plan.is_array() {
            errors.push("metadata.plan must be an array of steps".to_string());
        }
    }

    let spec = action.and_then(|a| check_spec(a, &request.metadata, &mut errors));

    match (action, details, priority, spec) {
        (Some(action), Some(details), Some(priority), Some(spec)) if errors.is_empty() => {
            Ok(Checked {
                action,
                details,
                target,
                priority,
                spec,
            })
        }
        _ => Err(errors),
    }
}

fn check_action(tag: &str, errors: &mut Vec<String>) -> Option<TaskAction> {
    if tag.trim().is_empty() {
        errors.push("action is required".to_string());
        return None;
    }
    let parsed = TaskAction::parse(tag);
    if parsed.is_none() {
        let valid: Vec<&str> = TaskAction::ALL.iter().map(TaskAction::as_str).collect();
        errors.push(format!(
            "action '{tag}' is not one of: {}",
            valid.join(", ")
        ));
    }
    parsed
}

fn check_details(details: &str, errors: &mut Vec<String>) -> Option<String> {
    let trimmed = details.trim();
    if trimmed.is_empty() {
        errors.push("details must be a non-empty string".to_string());
        return None;
    }
    if trimmed.chars().count() > MAX_DETAILS_LEN {
        errors.push(format!(
            "details must be at most {MAX_DETAILS_LEN} characters"
        ));
        return None;
    }
    Some(trimmed.to_string())
}

fn check_target(value: &Value, errors: &mut Vec<String>) -> Option<Target> {
    let Some(obj) = value.as_object() else {
        errors.push("target must be an object with numeric x, y, z".to_string());
        return None;
    };

    let mut axis = |name: &str| -> Option<f64> {
        match obj.get(name).and_then(Value::as_f64) {
            Some(v) if v.is_finite() => Some(v),
            _ => {
                errors.push(format!("target.{name} must be a finite number"));
                None
            }
        }
    };
    let (x, y, z) = (axis("x"), axis("y"), axis("z"));

    let dimension = optional_string(obj, "dimension", "target", errors);
    let facing = optional_string(obj, "facing", "target", errors);

    Some(Target {
        x: x?,
        y: y?,
        z: z?,
        dimension,
        facing,
    })
}

fn check_spec(
    action: TaskAction,
    meta: &Map<String, Value>,
    errors: &mut Vec<String>,
) -> Option<ActionSpec> {
    let before = errors.len();
    let spec = match action {
        TaskAction::Build => ActionSpec::Build {
            structure: optional_string(meta, "structure", "metadata", errors),
            blueprint: match meta.get("blueprint") {
                None => None,
                Some(v) if v.is_object() => Some(v.clone()),
                Some(_) => {
                    errors.push("metadata.blueprint must be an object".to_string());
                    None
                }
            },
        },
        TaskAction::Mine => {
            let resource = required_string(meta, "resource", action, errors);
            let hazards = match meta.get("hazards") {
                None => {
                    errors.push("metadata.hazards array is required for mine".to_string());
                    None
                }
                Some(v) => string_array(v, "metadata.hazards", errors),
            };
            ActionSpec::Mine {
                resource: resource.unwrap_or_default(),
                hazards: hazards.unwrap_or_default(),
                quantity: optional_count(meta, "quantity", errors),
            }
        }
        TaskAction::Explore => ActionSpec::Explore {
            radius: optional_positive(meta, "radius", errors),
        },
        TaskAction::Gather => ActionSpec::Gather {
            resource: optional_string(meta, "resource", "metadata", errors),
            quantity: optional_count(meta, "quantity", errors),
        },
        TaskAction::Guard => ActionSpec::Guard {
            radius: optional_positive(meta, "radius", errors),
            duration_secs: optional_count(meta, "durationSecs", errors),
        },
        TaskAction::Craft => {
            let output = required_string(meta, "output", action, errors);
            let recipe = check_recipe(meta.get("recipe"), errors);
            ActionSpec::Craft {
                output: output.unwrap_or_default(),
                recipe: recipe.unwrap_or_default(),
                quantity: optional_count(meta, "quantity", errors),
            }
        }
        TaskAction::Interact => ActionSpec::Interact {
            entity: optional_string(meta, "entity", "metadata", errors),
        },
        TaskAction::Combat => {
            let target = check_combat_target(meta.get("target"), errors);
            let style = match meta.get("style") {
                None => None,
                Some(Value::String(s)) => {
                    let parsed = CombatStyle::parse(s);
                    if parsed.is_none() {
                        let valid: Vec<&str> =
                            CombatStyle::ALL.iter().map(CombatStyle::as_str).collect();
                        errors.push(format!(
                            "metadata.style '{s}' must be one of: {}",
                            valid.join(", ")
                        ));
                    }
                    parsed
                }
                Some(_) => {
                    errors.push("metadata.style must be a string".to_string());
                    None
                }
            };
            ActionSpec::Combat {
                target: target.unwrap_or_default(),
                style,
            }
        }
        TaskAction::Support => ActionSpec::Support {
            assist: optional_string(meta, "assist", "metadata", errors),
        },
        TaskAction::Deliver => ActionSpec::Deliver {
            item: required_string(meta, "item", action, errors).unwrap_or_default(),
            recipient: optional_string(meta, "recipient", "metadata", errors),
            quantity: optional_count(meta, "quantity", errors),
        },
    };
    (errors.len() == before).then_some(spec)
}

fn check_recipe(value: Option<&Value>, errors: &mut Vec<String>) -> Option<Vec<RecipeIngredient>> {
    let Some(value) = value else {
        errors.push("metadata.recipe is required for craft".to_string());
        return None;
    };
    let Some(items) = value.as_array().filter(|a| !a.is_empty()) else {
        errors.push("metadata.recipe must be a non-empty array".to_string());
        return None;
    };

    let mut recipe = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match item {
            Value::String(name) if !name.trim().is_empty() => recipe.push(RecipeIngredient {
                item: name.trim().to_string(),
                count: 1,
            }),
            Value::Object(obj) => {
                let name = obj
                    .get("item")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                let count = match obj.get("count") {
                    None => Some(1),
                    Some(c) => c.as_u64().filter(|n| *n > 0),
                };
                match (name, count) {
                    (Some(name), Some(count)) => recipe.push(RecipeIngredient {
                        item: name.to_string(),
                        count,
                    }),
                    (None, _) => errors.push(format!(
                        "metadata.recipe[{idx}].item must be a non-empty string"
                    )),
                    (_, None) => errors.push(format!(
                        "metadata.recipe[{idx}].count must be a positive integer"
                    )),
                }
            }
            _ => errors.push(format!(
                "metadata.recipe[{idx}] must be an item name or {{item, count}} object"
            )),
        }
    }
    Some(recipe)
}

fn check_combat_target(value: Option<&Value>, errors: &mut Vec<String>) -> Option<String> {
    let descriptor = match value {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Object(obj)) => ["name", "type"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(|s| s.trim().to_string()),
        _ => None,
    };
    match descriptor.filter(|s| !s.is_empty()) {
        Some(d) => Some(d),
        None => {
            errors.push(
                "metadata.target descriptor (string or {name|type}) is required for combat"
                    .to_string(),
            );
            None
        }
    }
}

fn required_string(
    meta: &Map<String, Value>,
    key: &str,
    action: TaskAction,
    errors: &mut Vec<String>,
) -> Option<String> {
    match meta.get(key).and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Some(s.to_string()),
        _ => {
            errors.push(format!(
                "metadata.{key} must be a non-empty string for {action}"
            ));
            None
        }
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    key: &str,
    scope: &str,
    errors: &mut Vec<String>,
) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(format!("{scope}.{key} must be a string"));
            None
        }
    }
}

fn optional_count(meta: &Map<String, Value>, key: &str, errors: &mut Vec<String>) -> Option<u64> {
    let value = meta.get(key)?;
    match value.as_u64().filter(|n| *n > 0) {
        Some(n) => Some(n),
        None => {
            errors.push(format!("metadata.{key} must be a positive integer"));
            None
        }
    }
}

fn optional_positive(meta: &Map<String, Value>, key: &str, errors: &mut Vec<String>) -> Option<f64> {
    let value = meta.get(key)?;
    match value.as_f64().filter(|n| n.is_finite() && *n > 0.0) {
        Some(n) => Some(n),
        None => {
            errors.push(format!("metadata.{key} must be a positive number"));
            None
        }
    }
}

fn string_array(value: &Value, path: &str, errors: &mut Vec<String>) -> Option<Vec<String>> {
    let Some(items) = value.as_array() else {
        errors.push(format!("{path} must be an array"));
        return None;
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            Some(s) => out.push(s.to_string()),
            None => {
                errors.push(format!("{path} entries must be strings"));
                return None;
            }
        }
    }
    Some(out)
}
