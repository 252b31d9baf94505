// Approval Harness Library - ephemeral-infrastructure test harness for
// human-gated automation workflows. Exposes the harnesses, the scenario
// orchestrator and the provider abstractions for tests and the CLI.

pub mod config;
pub mod errors;
pub mod harness;
pub mod lint;
pub mod orchestrator;
pub mod providers;
pub mod retry;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{ConfigError, HarnessConfig};
pub use errors::{HarnessError, ProviderError, TeardownError};
pub use harness::{DocumentHarness, PollMode, Stack, StackHarness};
pub use lint::{lint_paths, LintError, LintReport};
pub use orchestrator::{load_assets, Orchestrator, RunReport, RunSummary, ScenarioSettings};
pub use providers::{
    AutomationService, IdentityService, ProviderClients, ProvisioningService, SimulatedCloud,
    SimulationProfile,
};
pub use retry::{PollPolicy, RetryPolicy};
pub use telemetry::{create_run_span, generate_correlation_id, init_telemetry};
