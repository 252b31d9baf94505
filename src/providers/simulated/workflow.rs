// Automation document model used by the simulator.
// Only the parts that drive execution state are interpreted.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::providers::types::ExecutionParameters;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder pattern"));

static ROLE_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:role/[\w+=,.@/-]+$").expect("role arn pattern")
});

/// Whether `value` has the shape of an assumable IAM role identifier
pub fn is_role_arn(value: &str) -> bool {
    ROLE_ARN.is_match(value)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    schema_version: String,
    #[serde(default)]
    assume_role: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, RawParameter>,
    #[serde(default)]
    main_steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    action: String,
    #[serde(default)]
    inputs: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub list: bool,
    pub default: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Manual approval; left with Approve or Reject
    Approve { approvers: String },
    /// Manual pause; left with Resume
    Pause,
    DeleteStack { stack_name: String },
    /// Any other action completes as soon as it runs
    Passthrough(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStep {
    pub name: String,
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub assume_role: Option<String>,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub steps: Vec<WorkflowStep>,
}

/// A step with its inputs resolved against one execution's parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundStep {
    Approve { name: String, approvers: Vec<String> },
    Pause { name: String },
    DeleteStack { name: String, stack_ref: String },
    Instant { name: String },
}

impl BoundStep {
    pub fn name(&self) -> &str {
        match self {
            BoundStep::Approve { name, .. }
            | BoundStep::Pause { name }
            | BoundStep::DeleteStack { name, .. }
            | BoundStep::Instant { name } => name,
        }
    }
}

impl WorkflowDefinition {
    pub fn parse(content: &str) -> Result<Self, String> {
        let raw: RawDocument =
            serde_json::from_str(content).map_err(|e| format!("invalid document content: {e}"))?;

        if raw.schema_version != "0.3" {
            return Err(format!(
                "unsupported schemaVersion {} for automation documents",
                raw.schema_version
            ));
        }
        if raw.main_steps.is_empty() {
            return Err("document declares no mainSteps".to_string());
        }

        let mut parameters = BTreeMap::new();
        for (name, declared) in raw.parameters {
            let list = declared.kind == "StringList";
            let default = declared.default.map(|value| values_of(&value));
            parameters.insert(name, ParameterSpec { list, default });
        }

        let mut steps = Vec::with_capacity(raw.main_steps.len());
        for step in raw.main_steps {
            if steps.iter().any(|s: &WorkflowStep| s.name == step.name) {
                return Err(format!("duplicate step name {}", step.name));
            }
            let action = match step.action.as_str() {
                "aws:approve" => StepAction::Approve {
                    approvers: input_text(&step.inputs, "Approvers").ok_or_else(|| {
                        format!("step {} is missing input Approvers", step.name)
                    })?,
                },
                "aws:pause" => StepAction::Pause,
                "aws:deleteStack" => StepAction::DeleteStack {
                    stack_name: input_text(&step.inputs, "StackName").ok_or_else(|| {
                        format!("step {} is missing input StackName", step.name)
                    })?,
                },
                other if other.starts_with("aws:") => StepAction::Passthrough(other.to_string()),
                other => return Err(format!("step {} uses unknown action {other}", step.name)),
            };
            steps.push(WorkflowStep {
                name: step.name,
                action,
            });
        }

        Ok(Self {
            assume_role: raw.assume_role,
            parameters,
            steps,
        })
    }

    /// Merge provided values with declared defaults. Undeclared inputs and
    /// missing required inputs are rejected.
    pub fn bind(&self, provided: &ExecutionParameters) -> Result<BTreeMap<String, Vec<String>>, String> {
        for (key, values) in provided.iter() {
            let declared = self
                .parameters
                .get(key)
                .ok_or_else(|| format!("parameter {key} is not declared by the document"))?;
            if !declared.list && values.len() > 1 {
                return Err(format!("parameter {key} accepts a single value"));
            }
        }

        let mut bound = BTreeMap::new();
        for (name, declared) in &self.parameters {
            let values = match provided.get(name) {
                Some(values) => values.to_vec(),
                None => declared
                    .default
                    .clone()
                    .ok_or_else(|| format!("required parameter {name} was not provided"))?,
            };
            bound.insert(name.clone(), values);
        }
        Ok(bound)
    }

    /// Resolve every step's inputs for one execution
    pub fn bind_steps(&self, values: &BTreeMap<String, Vec<String>>) -> Vec<BoundStep> {
        self.steps
            .iter()
            .map(|step| {
                let name = step.name.clone();
                match &step.action {
                    StepAction::Approve { approvers } => BoundStep::Approve {
                        name,
                        approvers: resolve_list(approvers, values),
                    },
                    StepAction::Pause => BoundStep::Pause { name },
                    StepAction::DeleteStack { stack_name } => BoundStep::DeleteStack {
                        name,
                        stack_ref: resolve_text(stack_name, values),
                    },
                    StepAction::Passthrough(_) => BoundStep::Instant { name },
                }
            })
            .collect()
    }

    pub fn resolved_role(&self, values: &BTreeMap<String, Vec<String>>) -> Option<String> {
        self.assume_role
            .as_deref()
            .map(|template| resolve_text(template, values))
            .filter(|role| !role.is_empty())
    }
}

fn values_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(scalar_text).collect(),
        other => vec![scalar_text(other)],
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn input_text(inputs: &Value, key: &str) -> Option<String> {
    match inputs.get(key)? {
        Value::Array(items) => Some(items.iter().map(scalar_text).collect::<Vec<_>>().join(",")),
        other => Some(scalar_text(other)),
    }
}

/// Substitute `{{Name}}` placeholders with the first bound value
fn resolve_text(template: &str, values: &BTreeMap<String, Vec<String>>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            values
                .get(&caps[1])
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// A template that is exactly one placeholder expands to the whole list
fn resolve_list(template: &str, values: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let trimmed = template.trim();
    if let Some(caps) = PLACEHOLDER.captures(trimmed) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(trimmed.len()) {
            return values.get(&caps[1]).cloned().unwrap_or_default();
        }
    }
    resolve_text(template, values)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
