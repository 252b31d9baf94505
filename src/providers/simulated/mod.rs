//! Deterministic in-memory cloud
//!
//! Implements the identity, automation and provisioning services without any
//! network access. Simulated time advances one tick per provider observation
//! (describe / status calls), so a run always takes the same path for the same
//! profile. Execution lifecycles are modelled by the `statig` machine in
//! [`execution`].

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::ProviderError;
use crate::providers::types::{
    CallerIdentity, DocumentDefinition, DocumentStatus, DocumentType, ExecutionParameters,
    ExecutionSnapshot, ExecutionStatus, SignalKind, StackDescription, StackOutputs,
    StackParameters, StackStatus, StackTemplate,
};
use crate::providers::{AutomationService, IdentityService, ProvisioningService};

pub mod execution;
pub mod workflow;

use execution::{ExecutionEvent, ExecutionMachine, SimulatedExecution};
use workflow::{is_role_arn, BoundStep, WorkflowDefinition};

/// Knobs for the simulated world
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationProfile {
    pub account_id: String,
    pub region: String,
    pub caller_name: String,
    /// Role names that `role_arn` can resolve
    pub roles: Vec<String>,
    pub stack_create_ticks: u32,
    pub stack_delete_ticks: u32,
    pub document_ticks: u32,
    /// Output keys every created stack exposes
    pub stack_output_keys: Vec<String>,
    /// Stack creation ends in `ROLLBACK_COMPLETE`
    pub fail_stack_creation: bool,
    /// Stack deletion ends in `DELETE_FAILED`
    pub fail_stack_deletion: bool,
    /// Ticks an execution may sit in a paused step before it times out
    pub approval_timeout_ticks: Option<u32>,
    /// Number of upcoming calls answered with a throttling error
    pub transient_faults: u32,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            account_id: "123456789012".to_string(),
            region: "us-east-1".to_string(),
            caller_name: "harness-runner".to_string(),
            roles: vec!["AutomationServiceRole".to_string()],
            stack_create_ticks: 3,
            stack_delete_ticks: 2,
            document_ticks: 1,
            stack_output_keys: vec!["SNSTopicArn".to_string()],
            fail_stack_creation: false,
            fail_stack_deletion: false,
            approval_timeout_ticks: None,
            transient_faults: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackPhase {
    Creating,
    Ready,
    RolledBack,
    Deleting,
    Deleted,
    DeleteFailed,
}

impl StackPhase {
    fn reported(&self) -> &'static str {
        match self {
            StackPhase::Creating => "CREATE_IN_PROGRESS",
            StackPhase::Ready => "CREATE_COMPLETE",
            StackPhase::RolledBack => "ROLLBACK_COMPLETE",
            StackPhase::Deleting => "DELETE_IN_PROGRESS",
            StackPhase::Deleted => "DELETE_COMPLETE",
            StackPhase::DeleteFailed => "DELETE_FAILED",
        }
    }
}

#[derive(Debug)]
struct SimStack {
    id: String,
    name: String,
    parameters: StackParameters,
    outputs: StackOutputs,
    phase: StackPhase,
    remaining: u32,
    reason: Option<String>,
}

impl SimStack {
    fn describe(&self) -> StackDescription {
        let reported = self.phase.reported();
        let outputs = match self.phase {
            StackPhase::Ready | StackPhase::Deleting => self.outputs.clone(),
            _ => StackOutputs::new(),
        };
        StackDescription {
            stack_id: self.id.clone(),
            stack_name: self.name.clone(),
            status: StackStatus::from_provider(reported),
            reported_status: reported.to_string(),
            reason: self.reason.clone(),
            outputs,
        }
    }
}

struct SimDocument {
    document_type: DocumentType,
    definition: Result<WorkflowDefinition, String>,
    status: DocumentStatus,
    remaining: u32,
}

struct SimExecution {
    execution: SimulatedExecution,
    /// Step index whose stack deletion has already been requested
    deletion_requested: Option<usize>,
    waited_ticks: u32,
}

#[derive(Default)]
struct World {
    tick: u64,
    faults_remaining: u32,
    stacks: Vec<SimStack>,
    documents: BTreeMap<String, SimDocument>,
    executions: BTreeMap<String, SimExecution>,
}

pub struct SimulatedCloud {
    profile: SimulationProfile,
    world: Mutex<World>,
}

impl SimulatedCloud {
    pub fn new(profile: SimulationProfile) -> Self {
        let world = World {
            faults_remaining: profile.transient_faults,
            ..World::default()
        };
        Self {
            profile,
            world: Mutex::new(world),
        }
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn document_registered(&self, name: &str) -> bool {
        self.world().documents.contains_key(name)
    }

    pub fn execution_ids(&self) -> Vec<String> {
        self.world().executions.keys().cloned().collect()
    }

    /// Status of an execution without advancing time
    pub fn peek_execution(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.world()
            .executions
            .get(execution_id)
            .map(|e| e.execution.status())
    }

    /// Latest stack with `name`, deleted or not, without advancing time
    pub fn peek_stack(&self, name: &str) -> Option<StackDescription> {
        self.world()
            .stacks
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map(SimStack::describe)
    }

    fn stack_id_for(&self, name: &str) -> String {
        format!(
            "arn:aws:cloudformation:{}:{}:stack/{}/{}",
            self.profile.region,
            self.profile.account_id,
            name,
            uuid::Uuid::new_v4()
        )
    }

    fn outputs_for(&self, name: &str) -> StackOutputs {
        self.profile
            .stack_output_keys
            .iter()
            .map(|key| {
                let value = match key.as_str() {
                    "SNSTopicArn" => format!(
                        "arn:aws:sns:{}:{}:{}-ApprovalTopic",
                        self.profile.region, self.profile.account_id, name
                    ),
                    other => format!("{name}-{other}"),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

impl World {
    fn take_fault(&mut self, operation: &str) -> Result<(), ProviderError> {
        if self.faults_remaining > 0 {
            self.faults_remaining -= 1;
            debug!(operation = operation, "Injecting simulated throttling fault");
            return Err(ProviderError::throttled(operation, "Rate exceeded"));
        }
        Ok(())
    }

    /// Stack lookup following provider rules: ids always match, names only
    /// match stacks that are not yet deleted.
    fn find_stack(&self, stack_ref: &str) -> Option<usize> {
        if stack_ref.starts_with("arn:") {
            return self.stacks.iter().position(|s| s.id == stack_ref);
        }
        self.stacks
            .iter()
            .rposition(|s| s.name == stack_ref && s.phase != StackPhase::Deleted)
    }

    fn begin_stack_deletion(&mut self, index: usize, ticks: u32) {
        let stack = &mut self.stacks[index];
        if matches!(stack.phase, StackPhase::Deleting | StackPhase::Deleted) {
            return;
        }
        info!(stack_id = %stack.id, "Simulated stack deletion started");
        stack.phase = StackPhase::Deleting;
        stack.remaining = ticks;
    }

    fn advance(&mut self, profile: &SimulationProfile) {
        self.tick += 1;

        for stack in &mut self.stacks {
            if !matches!(stack.phase, StackPhase::Creating | StackPhase::Deleting) {
                continue;
            }
            stack.remaining = stack.remaining.saturating_sub(1);
            if stack.remaining > 0 {
                continue;
            }
            stack.phase = match (stack.phase, profile.fail_stack_creation, profile.fail_stack_deletion) {
                (StackPhase::Creating, true, _) => {
                    stack.reason = Some("The following resource(s) failed to create: [InstanceOne]".to_string());
                    StackPhase::RolledBack
                }
                (StackPhase::Creating, false, _) => StackPhase::Ready,
                (StackPhase::Deleting, _, true) => {
                    stack.reason = Some("The following resource(s) failed to delete: [ApprovalTopic]".to_string());
                    StackPhase::DeleteFailed
                }
                _ => StackPhase::Deleted,
            };
            debug!(stack_id = %stack.id, status = stack.phase.reported(), "Simulated stack settled");
        }

        for document in self.documents.values_mut() {
            if document.status != DocumentStatus::Creating {
                continue;
            }
            document.remaining = document.remaining.saturating_sub(1);
            if document.remaining == 0 {
                document.status = if document.definition.is_ok() {
                    DocumentStatus::Active
                } else {
                    DocumentStatus::Failed
                };
            }
        }

        let ids: Vec<String> = self.executions.keys().cloned().collect();
        for id in ids {
            self.tick_execution(&id, profile);
        }
    }

    fn tick_execution(&mut self, execution_id: &str, profile: &SimulationProfile) {
        let Some(entry) = self.executions.get_mut(execution_id) else {
            return;
        };
        if entry.execution.status() == ExecutionStatus::Waiting {
            entry.waited_ticks += 1;
            if let Some(limit) = profile.approval_timeout_ticks {
                if entry.waited_ticks > limit {
                    entry.execution.handle(ExecutionEvent::WaitExpired);
                }
            }
        }
        self.drive_execution(execution_id, profile);
    }

    /// Run every step that can complete at this tick
    fn drive_execution(&mut self, execution_id: &str, profile: &SimulationProfile) {
        let step_budget = self
            .executions
            .get(execution_id)
            .map(|e| e.execution.context().cursor() + 64)
            .unwrap_or(0);

        for _ in 0..step_budget {
            let Some(entry) = self.executions.get(execution_id) else {
                return;
            };
            if entry.execution.status() != ExecutionStatus::InProgress {
                return;
            }
            let cursor = entry.execution.context().cursor();
            let step = entry.execution.context().current_step().cloned();
            let deletion_requested = entry.deletion_requested;

            let event = match step {
                Some(BoundStep::DeleteStack { stack_ref, .. }) => {
                    match self.find_stack(&stack_ref) {
                        None if deletion_requested == Some(cursor) => {
                            // name lookups stop matching once the stack is gone
                            ExecutionEvent::StepSettled { outcome: Ok(()) }
                        }
                        None => ExecutionEvent::StepSettled {
                            outcome: Err(format!("Stack {stack_ref} does not exist")),
                        },
                        Some(index) => {
                            if deletion_requested != Some(cursor) {
                                self.begin_stack_deletion(index, profile.stack_delete_ticks);
                                if let Some(entry) = self.executions.get_mut(execution_id) {
                                    entry.deletion_requested = Some(cursor);
                                }
                            }
                            match self.stacks[index].phase {
                                StackPhase::Deleted => ExecutionEvent::StepSettled { outcome: Ok(()) },
                                StackPhase::DeleteFailed => ExecutionEvent::StepSettled {
                                    outcome: Err(format!(
                                        "Stack {stack_ref} deletion failed: {}",
                                        StackPhase::DeleteFailed.reported()
                                    )),
                                },
                                _ => return,
                            }
                        }
                    }
                }
                _ => ExecutionEvent::Advance,
            };

            if let Some(entry) = self.executions.get_mut(execution_id) {
                entry.execution.handle(event);
            }
        }
    }
}

#[async_trait]
impl IdentityService for SimulatedCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProviderError> {
        self.world().take_fault("get_caller_identity")?;
        Ok(CallerIdentity {
            account: self.profile.account_id.clone(),
            arn: format!(
                "arn:aws:iam::{}:user/{}",
                self.profile.account_id, self.profile.caller_name
            ),
        })
    }

    async fn role_arn(&self, role_name: &str) -> Result<String, ProviderError> {
        self.world().take_fault("get_role")?;
        if self.profile.roles.iter().any(|r| r == role_name) {
            Ok(format!("arn:aws:iam::{}:role/{}", self.profile.account_id, role_name))
        } else {
            Err(ProviderError::not_found("get_role", format!("role/{role_name}")))
        }
    }
}

#[async_trait]
impl AutomationService for SimulatedCloud {
    async fn register_document(&self, definition: &DocumentDefinition) -> Result<DocumentStatus, ProviderError> {
        let mut world = self.world();
        world.take_fault("create_document")?;
        if world.documents.contains_key(&definition.name) {
            return Err(ProviderError::already_exists(
                "create_document",
                format!("document/{}", definition.name),
            ));
        }

        let parsed = WorkflowDefinition::parse(&definition.content);
        if let Err(reason) = &parsed {
            info!(document = %definition.name, reason = %reason, "Simulated document will fail validation");
        }
        world.documents.insert(
            definition.name.clone(),
            SimDocument {
                document_type: definition.document_type,
                definition: parsed,
                status: DocumentStatus::Creating,
                remaining: self.profile.document_ticks.max(1),
            },
        );
        Ok(DocumentStatus::Creating)
    }

    async fn document_status(&self, name: &str) -> Result<DocumentStatus, ProviderError> {
        let mut world = self.world();
        world.take_fault("describe_document")?;
        world.advance(&self.profile);
        world
            .documents
            .get(name)
            .map(|d| d.status)
            .ok_or_else(|| ProviderError::not_found("describe_document", format!("document/{name}")))
    }

    async fn start_execution(
        &self,
        document_name: &str,
        parameters: &ExecutionParameters,
    ) -> Result<String, ProviderError> {
        let mut world = self.world();
        world.take_fault("start_automation_execution")?;

        let document = world.documents.get(document_name).ok_or_else(|| {
            ProviderError::not_found("start_automation_execution", format!("document/{document_name}"))
        })?;
        if document.document_type != DocumentType::Automation {
            return Err(ProviderError::rejected(
                "start_automation_execution",
                format!("document {document_name} is not an automation document"),
            ));
        }
        if document.status != DocumentStatus::Active {
            return Err(ProviderError::invalid_state(
                "start_automation_execution",
                format!("document {document_name} is {}", document.status),
            ));
        }
        let definition = document.definition.as_ref().map_err(|reason| {
            ProviderError::invalid_state("start_automation_execution", reason.clone())
        })?;

        let values = definition
            .bind(parameters)
            .map_err(|reason| ProviderError::rejected("start_automation_execution", reason))?;
        let steps = definition.bind_steps(&values);
        let role_error = definition
            .resolved_role(&values)
            .filter(|role| !is_role_arn(role))
            .map(|role| format!("The defined assume role is unable to be assumed: {role}"));

        let execution_id = uuid::Uuid::new_v4().to_string();
        let execution = SimulatedExecution::start(ExecutionMachine::new(execution_id.clone(), steps, role_error));
        world.executions.insert(
            execution_id.clone(),
            SimExecution {
                execution,
                deletion_requested: None,
                waited_ticks: 0,
            },
        );
        world.drive_execution(&execution_id, &self.profile);

        info!(
            execution_id = %execution_id,
            document = %document_name,
            "Simulated execution started"
        );
        Ok(execution_id)
    }

    async fn execution_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, ProviderError> {
        let mut world = self.world();
        world.take_fault("get_automation_execution")?;
        world.advance(&self.profile);

        let entry = world.executions.get(execution_id).ok_or_else(|| {
            ProviderError::not_found("get_automation_execution", format!("execution/{execution_id}"))
        })?;
        let status = entry.execution.status();
        Ok(ExecutionSnapshot {
            execution_id: execution_id.to_string(),
            status,
            reported_status: status.as_str().to_string(),
            detail: entry.execution.detail(),
        })
    }

    async fn send_signal(&self, execution_id: &str, kind: SignalKind) -> Result<(), ProviderError> {
        let mut world = self.world();
        world.take_fault("send_automation_signal")?;

        let entry = world.executions.get_mut(execution_id).ok_or_else(|| {
            ProviderError::not_found("send_automation_signal", format!("execution/{execution_id}"))
        })?;
        let status = entry.execution.status();
        if status.is_terminal() {
            return Err(ProviderError::invalid_state(
                "send_automation_signal",
                format!("execution {execution_id} is already {status}"),
            ));
        }
        entry.execution.handle(ExecutionEvent::Signal(kind));
        if entry.execution.status() != ExecutionStatus::Waiting {
            entry.waited_ticks = 0;
        }
        Ok(())
    }

    async fn stop_execution(&self, execution_id: &str) -> Result<(), ProviderError> {
        let mut world = self.world();
        world.take_fault("stop_automation_execution")?;

        let entry = world.executions.get_mut(execution_id).ok_or_else(|| {
            ProviderError::not_found("stop_automation_execution", format!("execution/{execution_id}"))
        })?;
        let status = entry.execution.status();
        if status.is_terminal() {
            return Err(ProviderError::invalid_state(
                "stop_automation_execution",
                format!("execution {execution_id} is already {status}"),
            ));
        }
        entry.execution.handle(ExecutionEvent::Cancel);
        Ok(())
    }

    async fn deregister_document(&self, name: &str) -> Result<(), ProviderError> {
        let mut world = self.world();
        world.take_fault("delete_document")?;
        world
            .documents
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("delete_document", format!("document/{name}")))
    }
}

#[async_trait]
impl ProvisioningService for SimulatedCloud {
    async fn create_stack(
        &self,
        template: &StackTemplate,
        stack_name: &str,
        parameters: &StackParameters,
    ) -> Result<String, ProviderError> {
        let mut world = self.world();
        world.take_fault("create_stack")?;

        if template.body.trim().is_empty() {
            return Err(ProviderError::rejected(
                "create_stack",
                format!("template {} is empty", template.name),
            ));
        }
        if world.find_stack(stack_name).is_some() {
            return Err(ProviderError::already_exists("create_stack", format!("stack/{stack_name}")));
        }

        let id = self.stack_id_for(stack_name);
        world.stacks.push(SimStack {
            id: id.clone(),
            name: stack_name.to_string(),
            parameters: parameters.clone(),
            outputs: self.outputs_for(stack_name),
            phase: StackPhase::Creating,
            remaining: self.profile.stack_create_ticks.max(1),
            reason: None,
        });
        info!(
            stack_id = %id,
            parameters = ?parameters.keys().collect::<Vec<_>>(),
            "Simulated stack creation started"
        );
        Ok(id)
    }

    async fn describe_stack(&self, stack_ref: &str) -> Result<StackDescription, ProviderError> {
        let mut world = self.world();
        world.take_fault("describe_stacks")?;
        world.advance(&self.profile);

        world
            .find_stack(stack_ref)
            .map(|index| world.stacks[index].describe())
            .ok_or_else(|| ProviderError::not_found("describe_stacks", format!("stack/{stack_ref}")))
    }

    async fn delete_stack(&self, stack_ref: &str) -> Result<(), ProviderError> {
        let mut world = self.world();
        world.take_fault("delete_stack")?;
        // deleting an unknown stack is accepted, like the real service
        if let Some(index) = world.find_stack(stack_ref) {
            world.begin_stack_deletion(index, self.profile.stack_delete_ticks.max(1));
        }
        Ok(())
    }
}

impl SimulatedCloud {
    /// Parameters a stack was created with
    pub fn stack_parameters(&self, stack_ref: &str) -> Option<StackParameters> {
        let world = self.world();
        world
            .find_stack(stack_ref)
            .map(|index| world.stacks[index].parameters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPROVAL_DOCUMENT: &str = r#"{
        "schemaVersion": "0.3",
        "assumeRole": "{{AutomationAssumeRole}}",
        "parameters": {
            "StackNameOrId": {"type": "String"},
            "AutomationAssumeRole": {"type": "String", "default": ""},
            "Approvers": {"type": "StringList"}
        },
        "mainSteps": [
            {"name": "approve", "action": "aws:approve", "inputs": {"Approvers": ["{{Approvers}}"]}},
            {"name": "deleteStack", "action": "aws:deleteStack", "inputs": {"StackName": "{{StackNameOrId}}"}}
        ]
    }"#;

    fn template() -> StackTemplate {
        StackTemplate {
            name: "TwoInstances.yml".to_string(),
            body: "Resources: {}".to_string(),
        }
    }

    async fn ready_stack(cloud: &SimulatedCloud, name: &str) -> String {
        let id = cloud
            .create_stack(&template(), name, &StackParameters::new())
            .await
            .unwrap();
        loop {
            let description = cloud.describe_stack(&id).await.unwrap();
            if description.status == StackStatus::Ready {
                return id;
            }
        }
    }

    async fn active_document(cloud: &SimulatedCloud, name: &str) {
        let definition = DocumentDefinition::new(name, APPROVAL_DOCUMENT, DocumentType::Automation);
        cloud.register_document(&definition).await.unwrap();
        while cloud.document_status(name).await.unwrap() != DocumentStatus::Active {}
    }

    #[tokio::test]
    async fn test_deleted_stack_only_visible_by_id() {
        let cloud = SimulatedCloud::new(SimulationProfile::default());
        let id = ready_stack(&cloud, "stack-a").await;

        cloud.delete_stack("stack-a").await.unwrap();
        let mut status = StackStatus::Deleting;
        while status != StackStatus::Deleted {
            status = cloud.describe_stack(&id).await.unwrap().status;
        }

        assert!(cloud.describe_stack("stack-a").await.unwrap_err().is_not_found());
        assert_eq!(cloud.describe_stack(&id).await.unwrap().reported_status, "DELETE_COMPLETE");
    }

    #[tokio::test]
    async fn test_execution_deletes_stack_after_approval() {
        let cloud = SimulatedCloud::new(SimulationProfile::default());
        let stack_id = ready_stack(&cloud, "stack-a").await;
        active_document(&cloud, "doc").await;

        let params = ExecutionParameters::new()
            .single("StackNameOrId", "stack-a")
            .single("Approvers", "arn:aws:iam::123456789012:user/harness-runner");
        let execution_id = cloud.start_execution("doc", &params).await.unwrap();
        assert_eq!(cloud.peek_execution(&execution_id), Some(ExecutionStatus::Waiting));

        cloud.send_signal(&execution_id, SignalKind::Approve).await.unwrap();
        let mut snapshot = cloud.execution_status(&execution_id).await.unwrap();
        for _ in 0..10 {
            if snapshot.status.is_terminal() {
                break;
            }
            snapshot = cloud.execution_status(&execution_id).await.unwrap();
        }

        assert_eq!(snapshot.status, ExecutionStatus::Success);
        assert_eq!(cloud.describe_stack(&stack_id).await.unwrap().status, StackStatus::Deleted);
    }

    #[tokio::test]
    async fn test_malformed_role_fails_execution() {
        let cloud = SimulatedCloud::new(SimulationProfile::default());
        ready_stack(&cloud, "stack-a").await;
        active_document(&cloud, "doc").await;

        let params = ExecutionParameters::new()
            .single("StackNameOrId", "stack-a")
            .single("AutomationAssumeRole", "not-a-role")
            .single("Approvers", "arn:aws:iam::123456789012:user/harness-runner");
        let execution_id = cloud.start_execution("doc", &params).await.unwrap();

        let snapshot = cloud.execution_status(&execution_id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert!(snapshot.detail.unwrap().contains("not-a-role"));
    }

    #[tokio::test]
    async fn test_injected_faults_are_transient() {
        let cloud = SimulatedCloud::new(SimulationProfile {
            transient_faults: 1,
            ..SimulationProfile::default()
        });

        let err = cloud.caller_identity().await.unwrap_err();
        assert!(err.is_transient());
        assert!(cloud.caller_identity().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_role_is_not_found() {
        let cloud = SimulatedCloud::new(SimulationProfile::default());
        assert!(cloud.role_arn("Missing").await.unwrap_err().is_not_found());
        assert_eq!(
            cloud.role_arn("AutomationServiceRole").await.unwrap(),
            "arn:aws:iam::123456789012:role/AutomationServiceRole"
        );
    }
}
