//! Provider service abstractions
//!
//! The identity, automation and provisioning services are reached only through
//! these traits. Harnesses receive them as `Arc<dyn ...>` handles, so a run can be
//! driven by the in-memory simulator or by a real cloud backend without any
//! change to the orchestration code.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ProviderError;

pub mod simulated;
pub mod types;

#[cfg(feature = "aws")]
pub mod aws;

#[cfg(feature = "aws")]
pub use aws::AwsCloud;
pub use simulated::{SimulatedCloud, SimulationProfile};
pub use types::{
    CallerIdentity, DocumentDefinition, DocumentStatus, DocumentType, ExecutionParameters,
    ExecutionSnapshot, ExecutionStatus, SignalKind, StackDescription, StackOutputs,
    StackParameters, StackStatus, StackTemplate,
};

/// Caller identity and role lookups
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Identity of the principal issuing requests
    async fn caller_identity(&self) -> Result<CallerIdentity, ProviderError>;

    /// Resolve a named service role to its identifier
    async fn role_arn(&self, role_name: &str) -> Result<String, ProviderError>;
}

/// Document registry and automation execution engine
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AutomationService: Send + Sync {
    async fn register_document(&self, definition: &DocumentDefinition) -> Result<DocumentStatus, ProviderError>;

    async fn document_status(&self, name: &str) -> Result<DocumentStatus, ProviderError>;

    async fn start_execution(
        &self,
        document_name: &str,
        parameters: &ExecutionParameters,
    ) -> Result<String, ProviderError>;

    async fn execution_status(&self, execution_id: &str) -> Result<ExecutionSnapshot, ProviderError>;

    async fn send_signal(&self, execution_id: &str, kind: SignalKind) -> Result<(), ProviderError>;

    async fn stop_execution(&self, execution_id: &str) -> Result<(), ProviderError>;

    async fn deregister_document(&self, name: &str) -> Result<(), ProviderError>;
}

/// Stack provisioning engine
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Start creating a stack; returns the provider-assigned stack id
    async fn create_stack(
        &self,
        template: &StackTemplate,
        stack_name: &str,
        parameters: &StackParameters,
    ) -> Result<String, ProviderError>;

    /// Describe by name or id. Deleted stacks are only reachable by id.
    async fn describe_stack(&self, stack_ref: &str) -> Result<StackDescription, ProviderError>;

    async fn delete_stack(&self, stack_ref: &str) -> Result<(), ProviderError>;
}

/// Client handles built once per run and injected into each harness
#[derive(Clone)]
pub struct ProviderClients {
    pub identity: Arc<dyn IdentityService>,
    pub automation: Arc<dyn AutomationService>,
    pub provisioning: Arc<dyn ProvisioningService>,
}

impl ProviderClients {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        automation: Arc<dyn AutomationService>,
        provisioning: Arc<dyn ProvisioningService>,
    ) -> Self {
        Self {
            identity,
            automation,
            provisioning,
        }
    }

    /// All three services backed by one simulated cloud
    pub fn simulated(cloud: Arc<SimulatedCloud>) -> Self {
        Self {
            identity: cloud.clone(),
            automation: cloud.clone(),
            provisioning: cloud,
        }
    }

    #[cfg(feature = "aws")]
    pub fn aws(cloud: Arc<AwsCloud>) -> Self {
        Self {
            identity: cloud.clone(),
            automation: cloud.clone(),
            provisioning: cloud,
        }
    }
}

impl std::fmt::Debug for ProviderClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClients").finish_non_exhaustive()
    }
}
