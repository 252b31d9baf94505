#![allow(dead_code)]
/// Shared setup for integration tests: fast policies, the bundled assets and
/// provider wrappers that misbehave on purpose.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use approval_harness::errors::ProviderError;
use approval_harness::providers::{
    AutomationService, DocumentDefinition, DocumentStatus, DocumentType, ExecutionParameters,
    ExecutionSnapshot, ExecutionStatus, ProviderClients, SignalKind, StackTemplate,
};
use approval_harness::{
    HarnessConfig, PollPolicy, RetryPolicy, ScenarioSettings, SimulatedCloud, SimulationProfile,
};
use async_trait::async_trait;

pub const RESOURCE_NAME: &str = "test-automation-delete-cf-stack-with-approval";

pub fn asset_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("documents/DeleteCloudFormationWithApproval")
}

pub fn template() -> StackTemplate {
    StackTemplate::from_file(asset_dir().join("TwoInstances.yml")).expect("template fixture")
}

pub fn approval_document() -> DocumentDefinition {
    DocumentDefinition::from_file(
        RESOURCE_NAME,
        asset_dir().join("aws-DeleteCloudFormationWithApproval.json"),
        DocumentType::Automation,
    )
    .expect("document fixture")
}

/// Same inputs as the approval document but deletes the stack straight away
pub fn unapproved_document() -> DocumentDefinition {
    DocumentDefinition::new(
        RESOURCE_NAME,
        r#"{
            "schemaVersion": "0.3",
            "assumeRole": "{{AutomationAssumeRole}}",
            "parameters": {
                "StackNameOrId": {"type": "String"},
                "AutomationAssumeRole": {"type": "String", "default": ""},
                "Approvers": {"type": "StringList"},
                "SNSTopicArn": {"type": "String"}
            },
            "mainSteps": [
                {"name": "deleteStack", "action": "aws:deleteStack",
                 "inputs": {"StackName": "{{StackNameOrId}}"}}
            ]
        }"#,
        DocumentType::Automation,
    )
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        jitter: false,
    }
}

pub fn fast_poll() -> PollPolicy {
    PollPolicy {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(200),
        multiplier: 2.0,
    }
}

pub fn fast_settings() -> ScenarioSettings {
    let mut settings = ScenarioSettings::from_config(&HarnessConfig::default());
    settings.stack_name = RESOURCE_NAME.to_string();
    settings.document_name = RESOURCE_NAME.to_string();
    settings.stack_create_timeout = Duration::from_secs(60);
    settings.document_create_timeout = Duration::from_secs(60);
    settings.execution_timeout = Duration::from_secs(60);
    settings.retry = fast_retry();
    settings.poll = fast_poll();
    settings
}

pub fn simulated(profile: SimulationProfile) -> (Arc<SimulatedCloud>, ProviderClients) {
    let cloud = Arc::new(SimulatedCloud::new(profile));
    let clients = ProviderClients::simulated(cloud.clone());
    (cloud, clients)
}

/// Automation service that panics when a chosen signal is sent
pub struct PanickingAutomation {
    pub inner: Arc<SimulatedCloud>,
    pub panic_on: SignalKind,
}

#[async_trait]
impl AutomationService for PanickingAutomation {
    async fn register_document(&self, definition: &DocumentDefinition) -> Result<DocumentStatus, ProviderError> {
        self.inner.register_document(definition).await
    }

    async fn document_status(&self, name: &str) -> Result<DocumentStatus, ProviderError> {
        self.inner.document_status(name).await
    }

    async fn start_execution(
        &self,
        document_name: &str,
        parameters: &ExecutionParameters,
    ) -> Result<String, ProviderError> {
        self.inner.start_execution(document_name, parameters).await
    }

    async fn execution_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, ProviderError> {
        self.inner.execution_status(execution_id).await
    }

    async fn send_signal(&self, execution_id: &str, kind: SignalKind) -> Result<(), ProviderError> {
        if kind == self.panic_on {
            panic!("signal handler blew up for {execution_id}");
        }
        self.inner.send_signal(execution_id, kind).await
    }

    async fn stop_execution(&self, execution_id: &str) -> Result<(), ProviderError> {
        self.inner.stop_execution(execution_id).await
    }

    async fn deregister_document(&self, name: &str) -> Result<(), ProviderError> {
        self.inner.deregister_document(name).await
    }
}

/// Automation service that reports the first `slow_reads` status reads of
/// every execution as still in progress, like an engine that has not reached
/// its first step yet
pub struct SlowStartAutomation {
    pub inner: Arc<SimulatedCloud>,
    pub slow_reads: u32,
    pub reads: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl AutomationService for SlowStartAutomation {
    async fn register_document(&self, definition: &DocumentDefinition) -> Result<DocumentStatus, ProviderError> {
        self.inner.register_document(definition).await
    }

    async fn document_status(&self, name: &str) -> Result<DocumentStatus, ProviderError> {
        self.inner.document_status(name).await
    }

    async fn start_execution(
        &self,
        document_name: &str,
        parameters: &ExecutionParameters,
    ) -> Result<String, ProviderError> {
        self.inner.start_execution(document_name, parameters).await
    }

    async fn execution_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, ProviderError> {
        let snapshot = self.inner.execution_status(execution_id).await?;
        let read = self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if read < self.slow_reads && !snapshot.status.is_terminal() {
            return Ok(ExecutionSnapshot {
                status: ExecutionStatus::InProgress,
                reported_status: ExecutionStatus::InProgress.to_string(),
                ..snapshot
            });
        }
        Ok(snapshot)
    }

    async fn send_signal(&self, execution_id: &str, kind: SignalKind) -> Result<(), ProviderError> {
        self.inner.send_signal(execution_id, kind).await
    }

    async fn stop_execution(&self, execution_id: &str) -> Result<(), ProviderError> {
        self.inner.stop_execution(execution_id).await
    }

    async fn deregister_document(&self, name: &str) -> Result<(), ProviderError> {
        self.inner.deregister_document(name).await
    }
}
