//! AWS backend: SSM Automation, CloudFormation, STS and IAM.
//!
//! SDK errors are folded into [`ProviderError`] by error code so the
//! harnesses can tell transient failures from missing resources.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_cloudformation::types::Parameter;
use aws_sdk_ssm::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ssm::types::{DocumentFormat, SignalType};
use tracing::debug;

use crate::errors::ProviderError;
use crate::providers::types::{
    CallerIdentity, DocumentDefinition, DocumentStatus, DocumentType, ExecutionParameters,
    ExecutionSnapshot, ExecutionStatus, SignalKind, StackDescription, StackOutputs,
    StackParameters, StackStatus, StackTemplate,
};
use crate::providers::{AutomationService, IdentityService, ProvisioningService};

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "TooManyUpdates",
    "RequestLimitExceeded",
];
const UNAVAILABLE_CODES: &[&str] = &["ServiceUnavailable", "InternalServerError", "InternalFailure"];
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidDocument",
    "AutomationExecutionNotFoundException",
    "NoSuchEntity",
];
const ALREADY_EXISTS_CODES: &[&str] = &["DocumentAlreadyExists", "AlreadyExistsException"];
const INVALID_STATE_CODES: &[&str] = &[
    "InvalidAutomationStatusUpdateException",
    "InvalidAutomationSignalException",
    "AutomationStepNotFoundException",
];

/// Map an SDK failure onto the provider error taxonomy
fn classify<E, R>(operation: &str, resource: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) {
        return ProviderError::unavailable(operation, DisplayErrorContext(&err).to_string());
    }

    let code = err.code().unwrap_or_default().to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    debug!(operation = operation, code = %code, message = %message, "AWS call failed");

    match code.as_str() {
        c if THROTTLING_CODES.contains(&c) => ProviderError::throttled(operation, message),
        c if UNAVAILABLE_CODES.contains(&c) => ProviderError::unavailable(operation, message),
        c if NOT_FOUND_CODES.contains(&c) => ProviderError::not_found(operation, resource),
        c if ALREADY_EXISTS_CODES.contains(&c) => ProviderError::already_exists(operation, resource),
        c if INVALID_STATE_CODES.contains(&c) => ProviderError::invalid_state(operation, message),
        // CloudFormation reports unknown stacks as a validation error
        "ValidationError" if message.contains("does not exist") => {
            ProviderError::not_found(operation, resource)
        }
        _ => ProviderError::rejected(operation, format!("{code}: {message}")),
    }
}

fn signal_type(kind: SignalKind) -> SignalType {
    match kind {
        SignalKind::Approve => SignalType::Approve,
        SignalKind::Reject => SignalType::Reject,
        SignalKind::StartStep => SignalType::StartStep,
        SignalKind::StopStep => SignalType::StopStep,
        SignalKind::Resume => SignalType::Resume,
    }
}

fn ssm_document_type(kind: DocumentType) -> aws_sdk_ssm::types::DocumentType {
    match kind {
        DocumentType::Automation => aws_sdk_ssm::types::DocumentType::Automation,
        DocumentType::Command => aws_sdk_ssm::types::DocumentType::Command,
    }
}

/// Handles to every AWS service the harness talks to
#[derive(Debug, Clone)]
pub struct AwsCloud {
    ssm: aws_sdk_ssm::Client,
    cloudformation: aws_sdk_cloudformation::Client,
    sts: aws_sdk_sts::Client,
    iam: aws_sdk_iam::Client,
}

impl AwsCloud {
    /// Build clients from the default credential chain for `region`
    pub async fn load(region: &str) -> Self {
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            ssm: aws_sdk_ssm::Client::new(&shared_config),
            cloudformation: aws_sdk_cloudformation::Client::new(&shared_config),
            sts: aws_sdk_sts::Client::new(&shared_config),
            iam: aws_sdk_iam::Client::new(&shared_config),
        }
    }
}

#[async_trait]
impl IdentityService for AwsCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity, ProviderError> {
        let output = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| classify("get_caller_identity", "caller", e))?;
        Ok(CallerIdentity {
            account: output.account().unwrap_or_default().to_string(),
            arn: output.arn().unwrap_or_default().to_string(),
        })
    }

    async fn role_arn(&self, role_name: &str) -> Result<String, ProviderError> {
        let output = self
            .iam
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| classify("get_role", &format!("role/{role_name}"), e))?;
        output
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| ProviderError::not_found("get_role", format!("role/{role_name}")))
    }
}

#[async_trait]
impl AutomationService for AwsCloud {
    async fn register_document(&self, definition: &DocumentDefinition) -> Result<DocumentStatus, ProviderError> {
        let resource = format!("document/{}", definition.name);
        let output = self
            .ssm
            .create_document()
            .name(&definition.name)
            .content(&definition.content)
            .document_type(ssm_document_type(definition.document_type))
            .document_format(DocumentFormat::Json)
            .send()
            .await
            .map_err(|e| classify("create_document", &resource, e))?;
        Ok(output
            .document_description()
            .and_then(|d| d.status())
            .map(|s| DocumentStatus::from_provider(s.as_str()))
            .unwrap_or(DocumentStatus::Creating))
    }

    async fn document_status(&self, name: &str) -> Result<DocumentStatus, ProviderError> {
        let resource = format!("document/{name}");
        let output = self
            .ssm
            .describe_document()
            .name(name)
            .send()
            .await
            .map_err(|e| classify("describe_document", &resource, e))?;
        output
            .document()
            .and_then(|d| d.status())
            .map(|s| DocumentStatus::from_provider(s.as_str()))
            .ok_or_else(|| ProviderError::not_found("describe_document", resource))
    }

    async fn start_execution(
        &self,
        document_name: &str,
        parameters: &ExecutionParameters,
    ) -> Result<String, ProviderError> {
        let parameters: HashMap<String, Vec<String>> = parameters.clone().into_inner().into_iter().collect();
        let output = self
            .ssm
            .start_automation_execution()
            .document_name(document_name)
            .set_parameters(Some(parameters))
            .send()
            .await
            .map_err(|e| {
                classify("start_automation_execution", &format!("document/{document_name}"), e)
            })?;
        output
            .automation_execution_id()
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::rejected("start_automation_execution", "no execution id returned")
            })
    }

    async fn execution_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, ProviderError> {
        let resource = format!("execution/{execution_id}");
        let output = self
            .ssm
            .get_automation_execution()
            .automation_execution_id(execution_id)
            .send()
            .await
            .map_err(|e| classify("get_automation_execution", &resource, e))?;
        let execution = output
            .automation_execution()
            .ok_or_else(|| ProviderError::not_found("get_automation_execution", resource))?;
        let reported = execution
            .automation_execution_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "Pending".to_string());
        Ok(ExecutionSnapshot {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::from_provider(&reported),
            reported_status: reported,
            detail: execution.failure_message().map(str::to_string),
        })
    }

    async fn send_signal(&self, execution_id: &str, kind: SignalKind) -> Result<(), ProviderError> {
        self.ssm
            .send_automation_signal()
            .automation_execution_id(execution_id)
            .signal_type(signal_type(kind))
            .send()
            .await
            .map_err(|e| classify("send_automation_signal", &format!("execution/{execution_id}"), e))?;
        Ok(())
    }

    async fn stop_execution(&self, execution_id: &str) -> Result<(), ProviderError> {
        self.ssm
            .stop_automation_execution()
            .automation_execution_id(execution_id)
            .send()
            .await
            .map_err(|e| {
                classify("stop_automation_execution", &format!("execution/{execution_id}"), e)
            })?;
        Ok(())
    }

    async fn deregister_document(&self, name: &str) -> Result<(), ProviderError> {
        self.ssm
            .delete_document()
            .name(name)
            .send()
            .await
            .map_err(|e| classify("delete_document", &format!("document/{name}"), e))?;
        Ok(())
    }
}

#[async_trait]
impl ProvisioningService for AwsCloud {
    async fn create_stack(
        &self,
        template: &StackTemplate,
        stack_name: &str,
        parameters: &StackParameters,
    ) -> Result<String, ProviderError> {
        let parameters = parameters
            .iter()
            .map(|(key, value)| {
                Parameter::builder()
                    .parameter_key(key)
                    .parameter_value(value)
                    .build()
            })
            .collect::<Vec<_>>();
        let output = self
            .cloudformation
            .create_stack()
            .stack_name(stack_name)
            .template_body(&template.body)
            .set_parameters(Some(parameters))
            .send()
            .await
            .map_err(|e| classify("create_stack", &format!("stack/{stack_name}"), e))?;
        output
            .stack_id()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::rejected("create_stack", "no stack id returned"))
    }

    async fn describe_stack(&self, stack_ref: &str) -> Result<StackDescription, ProviderError> {
        let resource = format!("stack/{stack_ref}");
        let output = self
            .cloudformation
            .describe_stacks()
            .stack_name(stack_ref)
            .send()
            .await
            .map_err(|e| classify("describe_stacks", &resource, e))?;
        let stack = output
            .stacks()
            .first()
            .ok_or_else(|| ProviderError::not_found("describe_stacks", resource))?;

        let reported = stack
            .stack_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        let outputs: StackOutputs = stack
            .outputs()
            .iter()
            .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
            .collect();
        Ok(StackDescription {
            stack_id: stack.stack_id().unwrap_or(stack_ref).to_string(),
            stack_name: stack.stack_name().unwrap_or_default().to_string(),
            status: StackStatus::from_provider(&reported),
            reported_status: reported,
            reason: stack.stack_status_reason().map(str::to_string),
            outputs,
        })
    }

    async fn delete_stack(&self, stack_ref: &str) -> Result<(), ProviderError> {
        self.cloudformation
            .delete_stack()
            .stack_name(stack_ref)
            .send()
            .await
            .map_err(|e| classify("delete_stack", &format!("stack/{stack_ref}"), e))?;
        Ok(())
    }
}
