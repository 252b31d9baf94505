//! Approval workflow scenario
//!
//! Provisions a stack, registers the approval document, runs it against the
//! stack, waits for it to park at the approval step, approves it and checks
//! that the workflow removed the stack. The
//! workflow body runs inside a guarded future: whatever happens there,
//! including a panic, document teardown runs exactly once afterwards and the
//! stack is then destroyed as a safety net.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{error, info, warn, Instrument};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, Result, TeardownError};
use crate::harness::{DocumentHarness, PollMode, Stack, StackHarness};
use crate::providers::{
    DocumentDefinition, DocumentType, ExecutionParameters, ExecutionStatus, ProviderClients,
    SignalKind, StackParameters, StackStatus, StackTemplate,
};
use crate::retry::{PollPolicy, RetryPolicy};
use crate::telemetry::{create_run_span, generate_correlation_id};

/// Execution input naming the stack the workflow deletes
pub const PARAM_STACK_NAME_OR_ID: &str = "StackNameOrId";
pub const PARAM_ASSUME_ROLE: &str = "AutomationAssumeRole";
pub const PARAM_APPROVERS: &str = "Approvers";
pub const PARAM_TOPIC_ARN: &str = "SNSTopicArn";

/// Everything the scenario needs besides provider handles
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSettings {
    pub stack_name: String,
    pub document_name: String,
    pub stack_parameters: StackParameters,
    pub role_name: String,
    /// Passed verbatim as the assume role instead of resolving `role_name`
    pub assume_role_override: Option<String>,
    pub topic_output_key: String,
    pub stack_create_timeout: Duration,
    pub document_create_timeout: Duration,
    pub execution_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

impl ScenarioSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let name = config.resource_name();
        Self {
            stack_name: name.clone(),
            document_name: name,
            stack_parameters: StackParameters::from([
                ("AMI".to_string(), config.linux.ami.clone()),
                ("INSTANCETYPE".to_string(), config.linux.instance_type.clone()),
            ]),
            role_name: config.general.automation_service_role_name.clone(),
            assume_role_override: None,
            topic_output_key: PARAM_TOPIC_ARN.to_string(),
            stack_create_timeout: config.stack_create_timeout(),
            document_create_timeout: config.document_create_timeout(),
            execution_timeout: config.execution_timeout(),
            retry: config.retry_policy(),
            poll: config.poll_policy(),
        }
    }
}

/// Read the stack template and automation document named by `config`
pub fn load_assets(config: &HarnessConfig) -> Result<(StackTemplate, DocumentDefinition)> {
    let template = StackTemplate::from_file(&config.paths.template)
        .map_err(|e| unreadable(&config.paths.template, e))?;
    let document = DocumentDefinition::from_file(
        config.resource_name(),
        &config.paths.document,
        DocumentType::Automation,
    )
    .map_err(|e| unreadable(&config.paths.document, e))?;
    Ok((template, document))
}

fn unreadable(path: &Path, error: std::io::Error) -> HarnessError {
    HarnessError::Precondition(format!("cannot read {}: {error}", path.display()))
}

/// What a passing run observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub stack_id: String,
    pub document_name: String,
    pub execution_id: String,
    pub execution_status: ExecutionStatus,
    pub final_stack_status: String,
}

/// Outcome of one run. Teardown warnings never affect the verdict.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub verdict: Result<RunSummary>,
    pub teardown_warnings: Vec<TeardownError>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.is_ok()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.verdict {
            Ok(summary) => write!(
                f,
                "PASS run {}: execution {} reached {}, stack {} is {}",
                self.run_id,
                summary.execution_id,
                summary.execution_status,
                summary.stack_id,
                summary.final_stack_status
            )?,
            Err(error) => write!(f, "FAIL run {}: {error}", self.run_id)?,
        }
        for warning in &self.teardown_warnings {
            write!(f, "\n  teardown warning: {warning}")?;
        }
        Ok(())
    }
}

pub struct Orchestrator {
    clients: ProviderClients,
    settings: ScenarioSettings,
    stacks: StackHarness,
    documents: DocumentHarness,
}

impl Orchestrator {
    pub fn new(
        clients: ProviderClients,
        settings: ScenarioSettings,
        template: StackTemplate,
        document: DocumentDefinition,
    ) -> Self {
        let stacks = StackHarness::new(clients.provisioning.clone(), template, &settings.stack_name)
            .with_policies(settings.retry.clone(), settings.poll.clone());
        let documents = DocumentHarness::new(
            clients.automation.clone(),
            DocumentDefinition {
                name: settings.document_name.clone(),
                ..document
            },
        )
        .with_policies(settings.retry.clone(), settings.poll.clone());

        Self {
            clients,
            settings,
            stacks,
            documents,
        }
    }

    /// Run the scenario once; always returns a report, never panics.
    pub async fn run(self, backend: &str) -> RunReport {
        let run_id = generate_correlation_id();
        let span = create_run_span(&run_id, &self.settings.stack_name, backend);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(mut self, run_id: String) -> RunReport {
        let started_at = Utc::now();
        info!(
            stack.name = %self.settings.stack_name,
            document.name = %self.settings.document_name,
            "Starting approval workflow run"
        );

        let stack = match self
            .stacks
            .create(self.settings.stack_parameters.clone(), self.settings.stack_create_timeout)
            .await
        {
            Ok(stack) => stack,
            Err(error) => {
                error!(error = %error, "Stack provisioning failed, no document was registered");
                let teardown_warnings = self.stacks.destroy().await.err().into_iter().collect();
                return RunReport {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    verdict: Err(error),
                    teardown_warnings,
                };
            }
        };

        let verdict = match AssertUnwindSafe(self.drive_workflow(&stack))
            .catch_unwind()
            .await
        {
            Ok(verdict) => verdict,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "Workflow body panicked");
                Err(HarnessError::Panicked(message))
            }
        };
        if let Err(error) = &verdict {
            error!(error = %error, "Workflow verification failed");
        }

        let mut teardown_warnings = self.documents.destroy().await;
        if let Err(warning) = self.stacks.destroy().await {
            teardown_warnings.push(warning);
        }
        for warning in &teardown_warnings {
            warn!(warning = %warning, "Teardown incomplete");
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            verdict,
            teardown_warnings,
        };
        info!(
            passed = report.passed(),
            warnings = report.teardown_warnings.len(),
            elapsed_ms = report.elapsed().num_milliseconds(),
            "Run finished"
        );
        report
    }

    async fn drive_workflow(&mut self, stack: &Stack) -> Result<RunSummary> {
        self.documents
            .create(self.settings.document_create_timeout)
            .await?;

        let assume_role = match &self.settings.assume_role_override {
            Some(role) => role.clone(),
            None => {
                self.documents
                    .resolve_automation_role(self.clients.identity.as_ref(), &self.settings.role_name)
                    .await?
            }
        };
        let identity = self.clients.identity.clone();
        let caller = self
            .settings
            .retry
            .call("get_caller_identity", || identity.caller_identity())
            .await?;
        let topic_arn = self
            .stacks
            .require_output(&self.settings.topic_output_key)?
            .to_string();
        info!(approver = %caller.arn, topic = %topic_arn, "Resolved approval inputs");

        let parameters = ExecutionParameters::new()
            .single(PARAM_STACK_NAME_OR_ID, &stack.name)
            .single(PARAM_ASSUME_ROLE, assume_role)
            .multi(PARAM_APPROVERS, [caller.arn])
            .single(PARAM_TOPIC_ARN, topic_arn);
        let execution_id = self.documents.execute(&parameters).await?;

        // the engine may still report Pending or InProgress right after the start
        let before_approval = self
            .documents
            .poll_status(
                &execution_id,
                PollMode::Settle {
                    timeout: self.settings.execution_timeout,
                },
            )
            .await?;
        if before_approval.status != ExecutionStatus::Waiting {
            return Err(HarnessError::UnexpectedStatus {
                context: format!("execution {execution_id} before approval"),
                expected: ExecutionStatus::Waiting.to_string(),
                observed: before_approval.reported_status,
                detail: before_approval.detail,
            });
        }

        info!(execution.id = %execution_id, "Approving execution");
        self.documents
            .signal(&execution_id, SignalKind::Approve)
            .await?;

        let finished = self
            .documents
            .poll_status(
                &execution_id,
                PollMode::Block {
                    timeout: self.settings.execution_timeout,
                },
            )
            .await?;
        if finished.status != ExecutionStatus::Success {
            return Err(HarnessError::UnexpectedStatus {
                context: format!("execution {execution_id} after approval"),
                expected: ExecutionStatus::Success.to_string(),
                observed: finished.reported_status,
                detail: finished.detail,
            });
        }

        // deleted stacks are only reachable by id
        let described = self.stacks.status(&stack.id).await?;
        if described.status != StackStatus::Deleted {
            return Err(HarnessError::UnexpectedStatus {
                context: format!("stack {} after workflow", stack.id),
                expected: StackStatus::Deleted.to_string(),
                observed: described.reported_status,
                detail: described.reason,
            });
        }

        Ok(RunSummary {
            stack_id: stack.id.clone(),
            document_name: self.documents.document_name().to_string(),
            execution_id,
            execution_status: finished.status,
            final_stack_status: described.reported_status,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = HarnessConfig::default();
        let settings = ScenarioSettings::from_config(&config);
        assert_eq!(settings.stack_name, config.resource_name());
        assert_eq!(settings.document_name, settings.stack_name);
        assert_eq!(settings.stack_parameters["AMI"], config.linux.ami);
        assert_eq!(settings.stack_parameters["INSTANCETYPE"], config.linux.instance_type);
        assert_eq!(settings.topic_output_key, "SNSTopicArn");
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");
    }

    #[test]
    fn test_report_display() {
        let report = RunReport {
            run_id: "run-1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            verdict: Err(HarnessError::Precondition("no stack".to_string())),
            teardown_warnings: vec![TeardownError::new(
                "document doc",
                crate::errors::ProviderError::rejected("delete_document", "AccessDenied"),
            )],
        };
        let rendered = report.to_string();
        assert!(rendered.starts_with("FAIL run run-1"));
        assert!(rendered.contains("teardown warning"));
        assert!(!report.passed());
    }
}
