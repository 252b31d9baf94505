use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{HarnessError, ProviderError, Result, TeardownError};
use crate::providers::{
    AutomationService, DocumentDefinition, DocumentStatus, ExecutionParameters, ExecutionSnapshot,
    ExecutionStatus, IdentityService, SignalKind,
};
use crate::retry::{wait_until, PollPolicy, RetryPolicy, WaitOutcome};

/// How `poll_status` observes an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// One observation, returned as-is
    Snapshot,
    /// Poll until the execution is terminal or `timeout` elapses
    Block { timeout: Duration },
    /// Poll until the execution has left Pending and InProgress, that is
    /// until it waits for input or has finished
    Settle { timeout: Duration },
}

/// Owns one automation document and every execution started from it
pub struct DocumentHarness {
    automation: Arc<dyn AutomationService>,
    definition: DocumentDefinition,
    retry: RetryPolicy,
    poll: PollPolicy,
    registered: bool,
    status: Option<DocumentStatus>,
    executions: Vec<String>,
    observed: HashMap<String, ExecutionStatus>,
    destroyed: bool,
}

impl DocumentHarness {
    pub fn new(automation: Arc<dyn AutomationService>, definition: DocumentDefinition) -> Self {
        Self {
            automation,
            definition,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            registered: false,
            status: None,
            executions: Vec::new(),
            observed: HashMap::new(),
            destroyed: false,
        }
    }

    pub fn with_policies(mut self, retry: RetryPolicy, poll: PollPolicy) -> Self {
        self.retry = retry;
        self.poll = poll;
        self
    }

    pub fn document_name(&self) -> &str {
        &self.definition.name
    }

    pub fn status(&self) -> Option<DocumentStatus> {
        self.status
    }

    /// Executions started by this harness, oldest first
    pub fn executions(&self) -> &[String] {
        &self.executions
    }

    /// Register the document and wait until it is active or has failed.
    pub async fn create(&mut self, timeout: Duration) -> Result<DocumentStatus> {
        if self.registered {
            return Err(HarnessError::Precondition(format!(
                "document {} was already registered by this harness",
                self.definition.name
            )));
        }

        info!(
            document.name = %self.definition.name,
            document.kind = %self.definition.document_type,
            "Registering document"
        );
        let initial = self
            .retry
            .call("create_document", || self.automation.register_document(&self.definition))
            .await?;
        self.registered = true;
        self.status = Some(initial);

        let name = self.definition.name.clone();
        let outcome = wait_until(
            &self.poll,
            timeout,
            || self.automation.document_status(&name),
            |status: &DocumentStatus| status.is_terminal(),
        )
        .await?;

        match outcome {
            WaitOutcome::Reached(DocumentStatus::Active) => {
                self.status = Some(DocumentStatus::Active);
                info!(document.name = %name, "Document active");
                Ok(DocumentStatus::Active)
            }
            WaitOutcome::Reached(status) => {
                self.status = Some(status);
                warn!(document.name = %name, status = %status, "Document registration failed");
                Err(HarnessError::DocumentCreation {
                    document_name: name,
                    reported_status: status.to_string(),
                })
            }
            WaitOutcome::Expired { last, .. } => Err(HarnessError::ExecutionTimeout {
                operation: format!("registration of document {name}"),
                timeout,
                last_status: last
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| initial.to_string()),
            }),
        }
    }

    /// Look up the service role the workflow assumes. No workflow side effects.
    pub async fn resolve_automation_role(
        &self,
        identity: &dyn IdentityService,
        role_name: &str,
    ) -> Result<String> {
        let role = self
            .retry
            .call("get_role", || identity.role_arn(role_name))
            .await?;
        debug!(role_name = role_name, role = %role, "Resolved automation role");
        Ok(role)
    }

    /// Start an execution and return its id without waiting.
    pub async fn execute(&mut self, parameters: &ExecutionParameters) -> Result<String> {
        if self.status != Some(DocumentStatus::Active) {
            return Err(HarnessError::Precondition(format!(
                "document {} is not active",
                self.definition.name
            )));
        }

        let execution_id = self
            .retry
            .call("start_automation_execution", || {
                self.automation
                    .start_execution(&self.definition.name, parameters)
            })
            .await?;
        self.executions.push(execution_id.clone());

        info!(
            execution.id = %execution_id,
            document.name = %self.definition.name,
            parameters = ?parameters.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            "Execution started"
        );
        Ok(execution_id)
    }

    /// Observe an execution. Every observation is checked against the last one
    /// seen for the same execution: a status that moves backwards along
    /// Pending, InProgress/Waiting, terminal is an `UnexpectedStatus` error.
    pub async fn poll_status(&mut self, execution_id: &str, mode: PollMode) -> Result<ExecutionSnapshot> {
        let previous = self.observed.get(execution_id).copied();
        let (timeout, settled): (Duration, fn(ExecutionStatus) -> bool) = match mode {
            PollMode::Snapshot => {
                let snapshot = self
                    .retry
                    .call("get_automation_execution", || {
                        self.automation.execution_status(execution_id)
                    })
                    .await?;
                debug!(execution.id = %execution_id, status = %snapshot.status, "Execution snapshot");
                self.track_progress(execution_id, previous, &snapshot)?;
                return Ok(snapshot);
            }
            PollMode::Block { timeout } => (timeout, |status| status.is_terminal()),
            PollMode::Settle { timeout } => (timeout, |status| {
                !matches!(status, ExecutionStatus::Pending | ExecutionStatus::InProgress)
            }),
        };

        // latest accepted status; a regression ends the wait early
        let latest = Mutex::new(previous);
        let accepted = || *latest.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = wait_until(
            &self.poll,
            timeout,
            || self.automation.execution_status(execution_id),
            |snapshot: &ExecutionSnapshot| {
                let mut seen = latest.lock().unwrap_or_else(PoisonError::into_inner);
                if seen.is_some_and(|status| snapshot.status.rank() < status.rank()) {
                    return true;
                }
                *seen = Some(snapshot.status);
                settled(snapshot.status)
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Reached(snapshot) => {
                self.track_progress(execution_id, accepted(), &snapshot)?;
                info!(
                    execution.id = %execution_id,
                    status = %snapshot.reported_status,
                    "Execution settled"
                );
                Ok(snapshot)
            }
            WaitOutcome::Expired { last, attempts } => {
                if let Some(status) = accepted() {
                    self.observed.insert(execution_id.to_string(), status);
                }
                warn!(execution.id = %execution_id, attempts = attempts, "Execution wait timed out");
                Err(HarnessError::ExecutionTimeout {
                    operation: format!("execution {execution_id}"),
                    timeout,
                    last_status: last
                        .map(|s| s.reported_status)
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            }
        }
    }

    fn track_progress(
        &mut self,
        execution_id: &str,
        previous: Option<ExecutionStatus>,
        snapshot: &ExecutionSnapshot,
    ) -> Result<()> {
        if let Some(previous) = previous {
            if snapshot.status.rank() < previous.rank() {
                warn!(
                    execution.id = %execution_id,
                    previous = %previous,
                    status = %snapshot.status,
                    "Execution status moved backwards"
                );
                return Err(HarnessError::UnexpectedStatus {
                    context: format!("execution {execution_id} after {previous}"),
                    expected: format!("{previous} or later"),
                    observed: snapshot.reported_status.clone(),
                    detail: snapshot.detail.clone(),
                });
            }
        }
        self.observed.insert(execution_id.to_string(), snapshot.status);
        Ok(())
    }

    /// Send a control signal without waiting for its effect. A signal the
    /// execution can no longer accept is ignored.
    pub async fn signal(&self, execution_id: &str, kind: SignalKind) -> Result<()> {
        let sent = self
            .retry
            .call("send_automation_signal", || {
                self.automation.send_signal(execution_id, kind)
            })
            .await;

        match sent {
            Ok(()) => {
                info!(execution.id = %execution_id, signal = %kind, "Signal sent");
                Ok(())
            }
            Err(ProviderError::InvalidState { message, .. }) => {
                debug!(
                    execution.id = %execution_id,
                    signal = %kind,
                    reason = %message,
                    "Signal not applicable, ignored"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Cancel unfinished executions, then delete the document.
    ///
    /// Never fails: every problem is logged and returned as a warning. Calls
    /// after the first do nothing.
    pub async fn destroy(&mut self) -> Vec<TeardownError> {
        if self.destroyed {
            debug!(document.name = %self.definition.name, "Document already torn down");
            return Vec::new();
        }
        self.destroyed = true;

        let mut warnings = Vec::new();
        let executions = std::mem::take(&mut self.executions);
        for execution_id in &executions {
            if let Err(error) = self.cancel_execution(execution_id).await {
                warn!(execution.id = %execution_id, error = %error, "Failed to cancel execution");
                warnings.push(TeardownError::new(format!("execution {execution_id}"), error));
            }
        }

        if self.registered {
            let name = self.definition.name.clone();
            match self
                .retry
                .call("delete_document", || self.automation.deregister_document(&name))
                .await
            {
                Ok(()) => info!(document.name = %name, "Document deleted"),
                Err(error) if error.is_not_found() => {
                    debug!(document.name = %name, "Document already gone")
                }
                Err(error) => {
                    warn!(document.name = %name, error = %error, "Failed to delete document");
                    warnings.push(TeardownError::new(format!("document {name}"), error));
                }
            }
            self.registered = false;
            self.status = None;
        }

        warnings
    }

    async fn cancel_execution(&self, execution_id: &str) -> std::result::Result<(), ProviderError> {
        let snapshot = match self
            .retry
            .call("get_automation_execution", || {
                self.automation.execution_status(execution_id)
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error),
        };
        if snapshot.status.is_terminal() {
            debug!(execution.id = %execution_id, status = %snapshot.status, "Execution already finished");
            return Ok(());
        }

        info!(execution.id = %execution_id, status = %snapshot.status, "Cancelling execution");
        match self
            .retry
            .call("stop_automation_execution", || {
                self.automation.stop_execution(execution_id)
            })
            .await
        {
            Ok(()) => Ok(()),
            // finished between the status check and the stop request
            Err(ProviderError::InvalidState { .. } | ProviderError::NotFound { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{DocumentType, MockAutomationService, MockIdentityService};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn definition() -> DocumentDefinition {
        DocumentDefinition::new(
            "test-automation-delete-cf-stack-with-approval",
            r#"{"schemaVersion": "0.3", "mainSteps": []}"#,
            DocumentType::Automation,
        )
    }

    fn harness(mock: MockAutomationService) -> DocumentHarness {
        DocumentHarness::new(Arc::new(mock), definition()).with_policies(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                jitter: false,
            },
            PollPolicy {
                initial_interval: Duration::from_millis(100),
                max_interval: Duration::from_millis(100),
                multiplier: 1.0,
            },
        )
    }

    fn snapshot(status: ExecutionStatus) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: "exec-1".to_string(),
            status,
            reported_status: status.as_str().to_string(),
            detail: None,
        }
    }

    fn expect_active_document(mock: &mut MockAutomationService) {
        mock.expect_register_document()
            .times(1)
            .returning(|_| Ok(DocumentStatus::Creating));
        let polls = AtomicU32::new(0);
        mock.expect_document_status().returning(move |_| {
            if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(DocumentStatus::Creating)
            } else {
                Ok(DocumentStatus::Active)
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_for_active() {
        let mut mock = MockAutomationService::new();
        expect_active_document(&mut mock);

        let mut documents = harness(mock);
        assert_eq!(
            documents.create(Duration::from_secs(30)).await.unwrap(),
            DocumentStatus::Active
        );
        assert_eq!(documents.status(), Some(DocumentStatus::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_is_document_creation_error() {
        let mut mock = MockAutomationService::new();
        mock.expect_register_document()
            .returning(|_| Ok(DocumentStatus::Creating));
        mock.expect_document_status()
            .returning(|_| Ok(DocumentStatus::Failed));

        let mut documents = harness(mock);
        match documents.create(Duration::from_secs(30)).await {
            Err(HarnessError::DocumentCreation { reported_status, .. }) => {
                assert_eq!(reported_status, "Failed")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_requires_active_document() {
        let mut documents = harness(MockAutomationService::new());
        let result = documents.execute(&ExecutionParameters::new()).await;
        assert!(matches!(result, Err(HarnessError::Precondition(_))));
        assert!(documents.executions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_poll_times_out_with_last_status() {
        let mut mock = MockAutomationService::new();
        mock.expect_execution_status()
            .returning(|_| Ok(snapshot(ExecutionStatus::Waiting)));

        let mut documents = harness(mock);
        let err = documents
            .poll_status("exec-1", PollMode::Block { timeout: Duration::from_secs(2) })
            .await
            .unwrap_err();

        match err {
            HarnessError::ExecutionTimeout { last_status, timeout, .. } => {
                assert_eq!(last_status, "Waiting");
                assert_eq!(timeout, Duration::from_secs(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_returns_first_observation() {
        let mut mock = MockAutomationService::new();
        mock.expect_execution_status()
            .times(1)
            .returning(|_| Ok(snapshot(ExecutionStatus::Waiting)));

        let mut documents = harness(mock);
        let observed = documents.poll_status("exec-1", PollMode::Snapshot).await.unwrap();
        assert_eq!(observed.status, ExecutionStatus::Waiting);
    }

    fn sequence(statuses: Vec<ExecutionStatus>) -> MockAutomationService {
        let mut mock = MockAutomationService::new();
        let polls = AtomicU32::new(0);
        mock.expect_execution_status().returning(move |_| {
            let index = polls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(snapshot(statuses[index.min(statuses.len() - 1)]))
        });
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_past_in_progress() {
        let mut documents = harness(sequence(vec![
            ExecutionStatus::Pending,
            ExecutionStatus::InProgress,
            ExecutionStatus::Waiting,
        ]));

        let settled = documents
            .poll_status("exec-1", PollMode::Settle { timeout: Duration::from_secs(10) })
            .await
            .unwrap();
        assert_eq!(settled.status, ExecutionStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_moving_backwards_is_rejected() {
        let mut documents = harness(sequence(vec![
            ExecutionStatus::Success,
            ExecutionStatus::InProgress,
        ]));

        let first = documents.poll_status("exec-1", PollMode::Snapshot).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Success);

        match documents.poll_status("exec-1", PollMode::Snapshot).await {
            Err(HarnessError::UnexpectedStatus { expected, observed, .. }) => {
                assert_eq!(expected, "Success or later");
                assert_eq!(observed, "InProgress");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_poll_rejects_regression() {
        let mut documents = harness(sequence(vec![
            ExecutionStatus::InProgress,
            ExecutionStatus::Waiting,
            ExecutionStatus::Pending,
            ExecutionStatus::Success,
        ]));

        match documents
            .poll_status("exec-1", PollMode::Block { timeout: Duration::from_secs(10) })
            .await
        {
            Err(HarnessError::UnexpectedStatus { observed, .. }) => assert_eq!(observed, "Pending"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// Automation service whose status reads never complete
    struct UnresponsiveAutomation;

    #[async_trait::async_trait]
    impl AutomationService for UnresponsiveAutomation {
        async fn register_document(
            &self,
            _definition: &DocumentDefinition,
        ) -> std::result::Result<DocumentStatus, ProviderError> {
            Ok(DocumentStatus::Creating)
        }

        async fn document_status(&self, _name: &str) -> std::result::Result<DocumentStatus, ProviderError> {
            std::future::pending().await
        }

        async fn start_execution(
            &self,
            _document_name: &str,
            _parameters: &ExecutionParameters,
        ) -> std::result::Result<String, ProviderError> {
            Ok("exec-1".to_string())
        }

        async fn execution_status(
            &self,
            _execution_id: &str,
        ) -> std::result::Result<ExecutionSnapshot, ProviderError> {
            std::future::pending().await
        }

        async fn send_signal(
            &self,
            _execution_id: &str,
            _kind: SignalKind,
        ) -> std::result::Result<(), ProviderError> {
            Ok(())
        }

        async fn stop_execution(&self, _execution_id: &str) -> std::result::Result<(), ProviderError> {
            Ok(())
        }

        async fn deregister_document(&self, _name: &str) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_poll_times_out_when_provider_hangs() {
        let mut documents = DocumentHarness::new(Arc::new(UnresponsiveAutomation), definition());

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            documents.poll_status("exec-1", PollMode::Block { timeout: Duration::from_secs(1) }),
        )
        .await
        .expect("blocking poll must honour its own timeout");

        match result {
            Err(HarnessError::ExecutionTimeout { last_status, timeout, .. }) => {
                assert_eq!(last_status, "unknown");
                assert_eq!(timeout, Duration::from_secs(1));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_times_out_when_provider_hangs() {
        let mut documents = DocumentHarness::new(Arc::new(UnresponsiveAutomation), definition());

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            documents.create(Duration::from_secs(5)),
        )
        .await
        .expect("create must honour its own timeout");

        assert!(matches!(result, Err(HarnessError::ExecutionTimeout { .. })));
    }

    #[tokio::test]
    async fn test_signal_to_finished_execution_is_ignored() {
        let mut mock = MockAutomationService::new();
        mock.expect_send_signal().times(1).returning(|_, _| {
            Err(ProviderError::invalid_state("send_automation_signal", "execution is Success"))
        });

        let documents = harness(mock);
        assert!(documents.signal("exec-1", SignalKind::Approve).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_running_executions_once() {
        let mut mock = MockAutomationService::new();
        expect_active_document(&mut mock);
        mock.expect_start_execution()
            .times(1)
            .returning(|_, _| Ok("exec-1".to_string()));
        mock.expect_execution_status()
            .times(1)
            .returning(|_| Ok(snapshot(ExecutionStatus::Waiting)));
        mock.expect_stop_execution()
            .withf(|id| id == "exec-1")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_deregister_document().times(1).returning(|_| Ok(()));

        let mut documents = harness(mock);
        documents.create(Duration::from_secs(30)).await.unwrap();
        documents.execute(&ExecutionParameters::new()).await.unwrap();

        assert!(documents.destroy().await.is_empty());
        assert!(documents.destroy().await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_without_create_makes_no_calls() {
        let mut mock = MockAutomationService::new();
        mock.expect_deregister_document().times(0);
        let mut documents = harness(mock);
        assert!(documents.destroy().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_reports_failures_as_warnings() {
        let mut mock = MockAutomationService::new();
        expect_active_document(&mut mock);
        mock.expect_deregister_document()
            .returning(|_| Err(ProviderError::rejected("delete_document", "AccessDenied")));

        let mut documents = harness(mock);
        documents.create(Duration::from_secs(30)).await.unwrap();

        let warnings = documents.destroy().await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("document"));
    }

    #[tokio::test]
    async fn test_resolve_role_retries_transient_errors() {
        let mut identity = MockIdentityService::new();
        let calls = AtomicU32::new(0);
        identity.expect_role_arn().returning(move |name| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::throttled("get_role", "Rate exceeded"))
            } else {
                Ok(format!("arn:aws:iam::123456789012:role/{name}"))
            }
        });

        let documents = harness(MockAutomationService::new());
        let role = documents
            .resolve_automation_role(&identity, "AutomationServiceRole")
            .await
            .unwrap();
        assert_eq!(role, "arn:aws:iam::123456789012:role/AutomationServiceRole");
    }
}
