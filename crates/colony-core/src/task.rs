use crate::error::{ColonyError, ColonyResult};
use crate::validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Sender label used when a request does not name its origin.
pub const DEFAULT_SENDER: &str = "external";

/// Closed set of actions an agent can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Build,
    Mine,
    Explore,
    Gather,
    Guard,
    Craft,
    Interact,
    Combat,
    Support,
    Deliver,
}

impl TaskAction {
    /// Every recognized action, in declaration order.
    pub const ALL: [TaskAction; 10] = [
        TaskAction::Build,
        TaskAction::Mine,
        TaskAction::Explore,
        TaskAction::Gather,
        TaskAction::Guard,
        TaskAction::Craft,
        TaskAction::Interact,
        TaskAction::Combat,
        TaskAction::Support,
        TaskAction::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Build => "build",
            TaskAction::Mine => "mine",
            TaskAction::Explore => "explore",
            TaskAction::Gather => "gather",
            TaskAction::Guard => "guard",
            TaskAction::Craft => "craft",
            TaskAction::Interact => "interact",
            TaskAction::Combat => "combat",
            TaskAction::Support => "support",
            TaskAction::Deliver => "deliver",
        }
    }

    /// Parse an action tag, ignoring surrounding whitespace and case.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(tag))
    }

    /// Agent roles preferred for this action when the request names none.
    pub fn default_roles(&self) -> &'static [&'static str] {
        match self {
            TaskAction::Mine => &["miner", "worker"],
            TaskAction::Build => &["builder", "worker"],
            TaskAction::Guard => &["guard", "fighter"],
            TaskAction::Explore => &["scout", "explorer"],
            TaskAction::Gather => &["gatherer", "miner", "worker"],
            TaskAction::Craft => &["crafter", "builder"],
            TaskAction::Interact => &["support", "worker"],
            TaskAction::Combat => &["fighter", "guard"],
            TaskAction::Support => &["support", "worker"],
            TaskAction::Deliver => &["courier", "scout", "worker"],
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskAction {
    type Err = ColonyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ColonyError::ValidationFailed {
            errors: vec![format!("unknown action '{s}'")],
        })
    }
}

/// Scheduling tier. Declaration order is the ordering: `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in the target world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(0.0, 64.0, 0.0)
    }
}

/// Spatial target of a task: a position plus optional dimension and facing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facing: Option<String>,
}

impl Target {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            dimension: None,
            facing: None,
        }
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = Some(dimension.into());
        self
    }

    pub fn with_facing(mut self, facing: impl Into<String>) -> Self {
        self.facing = Some(facing.into());
        self
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.z)
    }
}

/// Combat styles accepted in `metadata.style`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombatStyle {
    Melee,
    Ranged,
    Defensive,
    Aggressive,
}

impl CombatStyle {
    pub const ALL: [CombatStyle; 4] = [
        CombatStyle::Melee,
        CombatStyle::Ranged,
        CombatStyle::Defensive,
        CombatStyle::Aggressive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CombatStyle::Melee => "melee",
            CombatStyle::Ranged => "ranged",
            CombatStyle::Defensive => "defensive",
            CombatStyle::Aggressive => "aggressive",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(tag.trim()))
    }
}

/// One ingredient of a crafting recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeIngredient {
    pub item: String,
    pub count: u64,
}

/// Typed, action-specific view of a task's metadata, produced at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionSpec {
    Build {
        structure: Option<String>,
        blueprint: Option<Value>,
    },
    Mine {
        resource: String,
        hazards: Vec<String>,
        quantity: Option<u64>,
    },
    Explore {
        radius: Option<f64>,
    },
    Gather {
        resource: Option<String>,
        quantity: Option<u64>,
    },
    Guard {
        radius: Option<f64>,
        duration_secs: Option<u64>,
    },
    Craft {
        output: String,
        recipe: Vec<RecipeIngredient>,
        quantity: Option<u64>,
    },
    Interact {
        entity: Option<String>,
    },
    Combat {
        target: String,
        style: Option<CombatStyle>,
    },
    Support {
        assist: Option<String>,
    },
    Deliver {
        item: String,
        recipient: Option<String>,
        quantity: Option<u64>,
    },
}

impl ActionSpec {
    pub fn action(&self) -> TaskAction {
        match self {
            ActionSpec::Build { .. } => TaskAction::Build,
            ActionSpec::Mine { .. } => TaskAction::Mine,
            ActionSpec::Explore { .. } => TaskAction::Explore,
            ActionSpec::Gather { .. } => TaskAction::Gather,
            ActionSpec::Guard { .. } => TaskAction::Guard,
            ActionSpec::Craft { .. } => TaskAction::Craft,
            ActionSpec::Interact { .. } => TaskAction::Interact,
            ActionSpec::Combat { .. } => TaskAction::Combat,
            ActionSpec::Support { .. } => TaskAction::Support,
            ActionSpec::Deliver { .. } => TaskAction::Deliver,
        }
    }
}

/// A task request as it arrives over the wire, before admission.
///
/// Fields are kept loose (plain strings and raw JSON) so that validation can
/// report every problem instead of failing on the first deserialization error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_agent_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl TaskRequest {
    pub fn new(action: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            details: details.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = serde_json::to_value(target).ok();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority.as_str().to_string());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_agent_roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Validate and normalize into an admitted [`Task`].
    pub fn admit(self) -> ColonyResult<Task> {
        Task::admit(self)
    }
}

/// An admitted task. Never mutated after admission; dispatch works on clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub action: TaskAction,
    pub details: String,
    pub target: Option<Target>,
    pub metadata: Map<String, Value>,
    pub spec: ActionSpec,
    pub priority: Priority,
    /// Roles this task prefers. Empty means any role.
    pub preferred_agent_roles: Vec<String>,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Validate a request and fill defaults: priority, preferred roles, sender.
    pub fn admit(request: TaskRequest) -> ColonyResult<Self> {
        let checked = validate::check(&request)
            .map_err(|errors| ColonyError::ValidationFailed { errors })?;

        let preferred_agent_roles = match &request.preferred_agent_roles {
            Some(roles) => roles.iter().map(|r| r.trim().to_ascii_lowercase()).collect(),
            None => checked
                .action
                .default_roles()
                .iter()
                .map(|r| (*r).to_string())
                .collect(),
        };

        let sender = request
            .sender
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SENDER)
            .to_string();

        Ok(Self {
            id: Uuid::new_v4(),
            action: checked.action,
            details: checked.details,
            target: checked.target,
            metadata: request.metadata,
            spec: checked.spec,
            priority: checked.priority,
            preferred_agent_roles,
            sender,
            created_at: Utc::now(),
        })
    }

    /// Whether an agent with `role` may take this task.
    pub fn accepts_role(&self, role: &str) -> bool {
        self.preferred_agent_roles.is_empty()
            || self
                .preferred_agent_roles
                .iter()
                .any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Number of steps in `metadata.plan`, if the task carries a plan.
    pub fn plan_len(&self) -> Option<usize> {
        self.metadata
            .get("plan")
            .and_then(Value::as_array)
            .map(Vec::len)
    }

    /// Convert back to the wire form, e.g. for delegation to a peer.
    pub fn to_request(&self) -> TaskRequest {
        TaskRequest {
            action: self.action.as_str().to_string(),
            details: self.details.clone(),
            target: self
                .target
                .as_ref()
                .and_then(|t| serde_json::to_value(t).ok()),
            metadata: self.metadata.clone(),
            priority: Some(self.priority.as_str().to_string()),
            preferred_agent_roles: Some(self.preferred_agent_roles.clone()),
            sender: Some(self.sender.clone()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mine_request() -> TaskRequest {
        TaskRequest::new("mine", "stone")
            .with_target(Target::new(10.0, 64.0, 5.0))
            .with_metadata("resource", json!("stone"))
            .with_metadata("hazards", json!([]))
    }

    #[test]
    fn test_action_parse_is_case_insensitive() {
        assert_eq!(TaskAction::parse(" Mine "), Some(TaskAction::Mine));
        assert_eq!(TaskAction::parse("teleport"), None);
        assert!("dance".parse::<TaskAction>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_admit_fills_defaults() {
        let task = mine_request().admit().unwrap();
        assert_eq!(task.action, TaskAction::Mine);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.preferred_agent_roles, vec!["miner", "worker"]);
        assert_eq!(task.sender, DEFAULT_SENDER);
        assert_eq!(
            task.target.as_ref().unwrap().position(),
            Position::new(10.0, 64.0, 5.0)
        );
        match &task.spec {
            ActionSpec::Mine { resource, hazards, .. } => {
                assert_eq!(resource, "stone");
                assert!(hazards.is_empty());
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_explicit_empty_roles_accept_anyone() {
        let task = mine_request().with_roles(Vec::<String>::new()).admit().unwrap();
        assert!(task.preferred_agent_roles.is_empty());
        assert!(task.accepts_role("builder"));
    }

    #[test]
    fn test_accepts_role_case_insensitive() {
        let task = mine_request().admit().unwrap();
        assert!(task.accepts_role("Miner"));
        assert!(!task.accepts_role("guard"));
    }

    #[test]
    fn test_admit_rejects_unknown_action() {
        let err = TaskRequest::new("teleport", "somewhere").admit().unwrap_err();
        assert!(matches!(err, ColonyError::ValidationFailed { .. }));
    }

    #[test]
    fn test_to_request_readmits() {
        let task = mine_request().with_priority(Priority::High).admit().unwrap();
        let again = task.to_request().admit().unwrap();
        assert_eq!(again.action, task.action);
        assert_eq!(again.priority, Priority::High);
        assert_eq!(again.spec, task.spec);
        assert_ne!(again.id, task.id);
    }

    #[test]
    fn test_plan_len() {
        let task = TaskRequest::new("build", "hut")
            .with_metadata("plan", json!(["foundation", "walls", "roof"]))
            .admit()
            .unwrap();
        assert_eq!(task.plan_len(), Some(3));
        assert_eq!(mine_request().admit().unwrap().plan_len(), None);
    }

    #[test]
    fn test_request_wire_format_is_camel_case() {
        let json = serde_json::to_value(mine_request().with_roles(["miner"])).unwrap();
        assert!(json.get("preferredAgentRoles").is_some());
        let parsed: TaskRequest = serde_json::from_value(json!({
            "action": "mine",
            "details": "stone",
            "metadata": {"resource": "stone", "hazards": []},
            "priority": "normal"
        }))
        .unwrap();
        assert_eq!(parsed.action, "mine");
        assert!(parsed.target.is_none());
    }
}
