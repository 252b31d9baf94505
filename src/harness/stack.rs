use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{HarnessError, Result, TeardownError};
use crate::providers::{
    ProvisioningService, StackDescription, StackOutputs, StackParameters, StackStatus, StackTemplate,
};
use crate::retry::{wait_until, PollPolicy, RetryPolicy, WaitOutcome};

/// A stack this harness created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub id: String,
    pub parameters: StackParameters,
    pub outputs: StackOutputs,
    pub status: StackStatus,
}

/// Owns the lifecycle of one ephemeral stack for the duration of a run
pub struct StackHarness {
    provisioning: Arc<dyn ProvisioningService>,
    template: StackTemplate,
    stack_name: String,
    retry: RetryPolicy,
    poll: PollPolicy,
    stack: Option<Stack>,
    delete_requested: bool,
}

impl StackHarness {
    pub fn new(
        provisioning: Arc<dyn ProvisioningService>,
        template: StackTemplate,
        stack_name: impl Into<String>,
    ) -> Self {
        Self {
            provisioning,
            template,
            stack_name: stack_name.into(),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            stack: None,
            delete_requested: false,
        }
    }

    pub fn with_policies(mut self, retry: RetryPolicy, poll: PollPolicy) -> Self {
        self.retry = retry;
        self.poll = poll;
        self
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    /// Create the stack and block until it is ready or has failed.
    pub async fn create(&mut self, parameters: StackParameters, timeout: Duration) -> Result<Stack> {
        if self.stack.is_some() {
            return Err(HarnessError::Precondition(format!(
                "stack {} was already created by this harness",
                self.stack_name
            )));
        }

        info!(
            stack_name = %self.stack_name,
            template = %self.template.name,
            parameters = ?parameters,
            "Creating stack"
        );
        let stack_id = self
            .retry
            .call("create_stack", || {
                self.provisioning
                    .create_stack(&self.template, &self.stack_name, &parameters)
            })
            .await?;

        // tracked before waiting so teardown can find it even if the wait fails
        self.stack = Some(Stack {
            name: self.stack_name.clone(),
            id: stack_id.clone(),
            parameters,
            outputs: StackOutputs::new(),
            status: StackStatus::Creating,
        });

        let outcome = wait_until(
            &self.poll,
            timeout,
            || self.provisioning.describe_stack(&stack_id),
            |description: &StackDescription| description.status.is_terminal(),
        )
        .await?;

        let description = match outcome {
            WaitOutcome::Reached(description) => description,
            WaitOutcome::Expired { last, attempts } => {
                warn!(stack_id = %stack_id, attempts = attempts, "Stack creation timed out");
                return Err(HarnessError::ExecutionTimeout {
                    operation: format!("creation of stack {}", self.stack_name),
                    timeout,
                    last_status: last
                        .map(|d| d.reported_status)
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        };

        let stack = self.record(&description);
        if description.status != StackStatus::Ready {
            warn!(
                stack_id = %stack_id,
                status = %description.reported_status,
                reason = ?description.reason,
                "Stack creation failed"
            );
            return Err(HarnessError::StackProvisioning {
                stack_name: self.stack_name.clone(),
                reported_status: description.reported_status,
                reason: description.reason,
            });
        }

        info!(
            stack_id = %stack_id,
            outputs = ?stack.outputs.keys().collect::<Vec<_>>(),
            "Stack ready"
        );
        Ok(stack)
    }

    fn record(&mut self, description: &StackDescription) -> Stack {
        let stack = self.stack.get_or_insert_with(|| Stack {
            name: description.stack_name.clone(),
            id: description.stack_id.clone(),
            parameters: StackParameters::new(),
            outputs: StackOutputs::new(),
            status: description.status,
        });
        stack.status = description.status;
        stack.outputs = description.outputs.clone();
        stack.clone()
    }

    /// Outputs observed when the stack became ready
    pub fn outputs(&self) -> Result<&StackOutputs> {
        match &self.stack {
            // outputs captured at ready time stay readable after teardown starts
            Some(stack) if stack.status == StackStatus::Ready || !stack.outputs.is_empty() => {
                Ok(&stack.outputs)
            }
            Some(stack) => Err(HarnessError::Precondition(format!(
                "stack {} is {}, outputs are only available after a successful create",
                stack.name, stack.status
            ))),
            None => Err(HarnessError::Precondition(format!(
                "stack {} has not been created",
                self.stack_name
            ))),
        }
    }

    /// Output value for `key`; a missing key is an error, never an empty value
    pub fn require_output(&self, key: &str) -> Result<&str> {
        self.outputs()?
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| HarnessError::MissingOutput {
                stack_name: self.stack_name.clone(),
                key: key.to_string(),
            })
    }

    /// Current status by reference. Use the stack id once deletion may have
    /// started; name lookups stop resolving after that.
    pub async fn status(&self, stack_ref: &str) -> Result<StackDescription> {
        let description = self
            .retry
            .call("describe_stacks", || self.provisioning.describe_stack(stack_ref))
            .await?;
        debug!(
            stack_ref = stack_ref,
            status = %description.reported_status,
            "Queried stack status"
        );
        Ok(description)
    }

    /// Request deletion unless the stack is already gone. Does not wait for
    /// completion; repeated calls are no-ops.
    pub async fn destroy(&mut self) -> std::result::Result<(), TeardownError> {
        let Some(stack) = self.stack.as_ref() else {
            debug!(stack_name = %self.stack_name, "No stack to destroy");
            return Ok(());
        };
        if self.delete_requested {
            debug!(stack_id = %stack.id, "Stack deletion already requested");
            return Ok(());
        }
        let stack_id = stack.id.clone();

        match self.status(&stack_id).await {
            Ok(description) if matches!(description.status, StackStatus::Deleted | StackStatus::Deleting) => {
                info!(stack_id = %stack_id, status = %description.reported_status, "Stack already being removed");
                self.mark_deleting(description.status);
                return Ok(());
            }
            Err(HarnessError::Provider(error)) if error.is_not_found() => {
                info!(stack_id = %stack_id, "Stack no longer exists");
                self.mark_deleting(StackStatus::Deleted);
                return Ok(());
            }
            Ok(_) => {}
            Err(error) => {
                warn!(stack_id = %stack_id, error = %error, "Could not query stack before deletion");
            }
        }

        info!(stack_id = %stack_id, "Deleting stack");
        self.retry
            .call("delete_stack", || self.provisioning.delete_stack(&stack_id))
            .await
            .map_err(|error| {
                warn!(stack_id = %stack_id, error = %error, "Stack deletion request failed");
                TeardownError::new(format!("stack {stack_id}"), error)
            })?;
        self.mark_deleting(StackStatus::Deleting);
        Ok(())
    }

    fn mark_deleting(&mut self, status: StackStatus) {
        self.delete_requested = true;
        if let Some(stack) = self.stack.as_mut() {
            stack.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::providers::MockProvisioningService;
    use std::sync::atomic::{AtomicU32, Ordering};

    const STACK_ID: &str = "arn:aws:cloudformation:us-east-1:123456789012:stack/test-stack/1";

    fn description(reported: &str) -> StackDescription {
        let status = StackStatus::from_provider(reported);
        let mut outputs = StackOutputs::new();
        if status == StackStatus::Ready {
            outputs.insert(
                "SNSTopicArn".to_string(),
                "arn:aws:sns:us-east-1:123456789012:topic".to_string(),
            );
        }
        StackDescription {
            stack_id: STACK_ID.to_string(),
            stack_name: "test-stack".to_string(),
            status,
            reported_status: reported.to_string(),
            reason: None,
            outputs,
        }
    }

    fn harness(mock: MockProvisioningService) -> StackHarness {
        StackHarness::new(
            Arc::new(mock),
            StackTemplate {
                name: "TwoInstances.yml".to_string(),
                body: "Resources: {}".to_string(),
            },
            "test-stack",
        )
        .with_policies(
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

    fn expect_create(mock: &mut MockProvisioningService) {
        mock.expect_create_stack()
            .times(1)
            .returning(|_, _, _| Ok(STACK_ID.to_string()));
    }

    fn parameters() -> StackParameters {
        StackParameters::from([
            ("AMI".to_string(), "ami-123".to_string()),
            ("INSTANCETYPE".to_string(), "t3.micro".to_string()),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_until_ready() {
        let mut mock = MockProvisioningService::new();
        expect_create(&mut mock);
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        mock.expect_describe_stack().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ProviderError::throttled("describe_stacks", "Rate exceeded")),
                1 => Ok(description("CREATE_IN_PROGRESS")),
                _ => Ok(description("CREATE_COMPLETE")),
            }
        });

        let mut stacks = harness(mock);
        let stack = stacks.create(parameters(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(stack.id, STACK_ID);
        assert_eq!(stack.status, StackStatus::Ready);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(stacks.require_output("SNSTopicArn").unwrap().starts_with("arn:aws:sns"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_carries_reported_status() {
        let mut mock = MockProvisioningService::new();
        expect_create(&mut mock);
        mock.expect_describe_stack()
            .returning(|_| Ok(description("ROLLBACK_COMPLETE")));

        let mut stacks = harness(mock);
        let err = stacks
            .create(parameters(), Duration::from_secs(60))
            .await
            .unwrap_err();

        match err {
            HarnessError::StackProvisioning { reported_status, .. } => {
                assert_eq!(reported_status, "ROLLBACK_COMPLETE")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(stacks.outputs(), Err(HarnessError::Precondition(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_times_out() {
        let mut mock = MockProvisioningService::new();
        expect_create(&mut mock);
        mock.expect_describe_stack()
            .returning(|_| Ok(description("CREATE_IN_PROGRESS")));

        let mut stacks = harness(mock);
        let err = stacks
            .create(parameters(), Duration::from_secs(1))
            .await
            .unwrap_err();

        match err {
            HarnessError::ExecutionTimeout { last_status, .. } => {
                assert_eq!(last_status, "CREATE_IN_PROGRESS")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // identity is kept so teardown can still remove the half-created stack
        assert_eq!(stacks.stack().map(|s| s.id.as_str()), Some(STACK_ID));
    }

    /// Accepts the create request, then never answers a describe
    struct StalledProvisioning;

    #[async_trait::async_trait]
    impl ProvisioningService for StalledProvisioning {
        async fn create_stack(
            &self,
            _template: &StackTemplate,
            _stack_name: &str,
            _parameters: &StackParameters,
        ) -> std::result::Result<String, ProviderError> {
            Ok(STACK_ID.to_string())
        }

        async fn describe_stack(
            &self,
            _stack_ref: &str,
        ) -> std::result::Result<StackDescription, ProviderError> {
            std::future::pending().await
        }

        async fn delete_stack(&self, _stack_ref: &str) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_times_out_when_describe_hangs() {
        let mut stacks = StackHarness::new(
            Arc::new(StalledProvisioning),
            StackTemplate {
                name: "TwoInstances.yml".to_string(),
                body: "Resources: {}".to_string(),
            },
            "test-stack",
        );

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            stacks.create(parameters(), Duration::from_secs(2)),
        )
        .await
        .expect("create must honour its own timeout");

        match result {
            Err(HarnessError::ExecutionTimeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_secs(2))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_outputs_require_create() {
        let stacks = harness(MockProvisioningService::new());
        assert!(matches!(stacks.outputs(), Err(HarnessError::Precondition(_))));
        assert!(matches!(
            stacks.require_output("SNSTopicArn"),
            Err(HarnessError::Precondition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_output_is_an_error() {
        let mut mock = MockProvisioningService::new();
        expect_create(&mut mock);
        mock.expect_describe_stack()
            .returning(|_| Ok(description("CREATE_COMPLETE")));

        let mut stacks = harness(mock);
        stacks.create(parameters(), Duration::from_secs(60)).await.unwrap();

        match stacks.require_output("QueueUrl") {
            Err(HarnessError::MissingOutput { key, .. }) => assert_eq!(key, "QueueUrl"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let mut mock = MockProvisioningService::new();
        expect_create(&mut mock);
        mock.expect_describe_stack()
            .returning(|_| Ok(description("CREATE_COMPLETE")));
        mock.expect_delete_stack().times(1).returning(|_| Ok(()));

        let mut stacks = harness(mock);
        stacks.create(parameters(), Duration::from_secs(60)).await.unwrap();

        stacks.destroy().await.unwrap();
        stacks.destroy().await.unwrap();
        assert_eq!(stacks.stack().map(|s| s.status), Some(StackStatus::Deleting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_skips_already_deleted_stack() {
        let mut mock = MockProvisioningService::new();
        expect_create(&mut mock);
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        mock.expect_describe_stack().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(description("CREATE_COMPLETE")),
                _ => Ok(description("DELETE_COMPLETE")),
            }
        });
        mock.expect_delete_stack().times(0);

        let mut stacks = harness(mock);
        stacks.create(parameters(), Duration::from_secs(60)).await.unwrap();

        stacks.destroy().await.unwrap();
        assert_eq!(stacks.stack().map(|s| s.status), Some(StackStatus::Deleted));
    }

    #[tokio::test]
    async fn test_destroy_without_create_is_noop() {
        let mut mock = MockProvisioningService::new();
        mock.expect_delete_stack().times(0);
        let mut stacks = harness(mock);
        assert!(stacks.destroy().await.is_ok());
    }
}
