use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub type StackParameters = BTreeMap<String, String>;
pub type StackOutputs = BTreeMap<String, String>;

/// Normalised lifecycle of a provisioned stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackStatus {
    Creating,
    Ready,
    Deleting,
    Deleted,
    Failed,
}

impl StackStatus {
    /// Map a provider status string (CloudFormation vocabulary) onto the lifecycle.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => StackStatus::Ready,
            "DELETE_IN_PROGRESS" => StackStatus::Deleting,
            "DELETE_COMPLETE" => StackStatus::Deleted,
            s if s.ends_with("_FAILED") || s.starts_with("ROLLBACK_") => StackStatus::Failed,
            s if s.contains("ROLLBACK") && s.ends_with("_COMPLETE") => StackStatus::Failed,
            _ => StackStatus::Creating,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StackStatus::Ready | StackStatus::Deleted | StackStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::Creating => "Creating",
            StackStatus::Ready => "Ready",
            StackStatus::Deleting => "Deleting",
            StackStatus::Deleted => "Deleted",
            StackStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template source handed to the provisioning service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTemplate {
    pub name: String,
    pub body: String,
}

impl StackTemplate {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, body })
    }
}

/// Point-in-time view of a stack as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub stack_id: String,
    pub stack_name: String,
    pub status: StackStatus,
    /// Raw provider status, e.g. `ROLLBACK_COMPLETE`
    pub reported_status: String,
    pub reason: Option<String>,
    pub outputs: StackOutputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentType {
    Automation,
    Command,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Automation => "Automation",
            DocumentType::Command => "Command",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Creating,
    Active,
    Failed,
}

impl DocumentStatus {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "Active" => DocumentStatus::Active,
            "Failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Creating,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::Creating)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentStatus::Creating => "Creating",
            DocumentStatus::Active => "Active",
            DocumentStatus::Failed => "Failed",
        })
    }
}

/// A named workflow definition ready to be registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDefinition {
    pub name: String,
    pub content: String,
    pub document_type: DocumentType,
}

impl DocumentDefinition {
    pub fn new(name: impl Into<String>, content: impl Into<String>, document_type: DocumentType) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            document_type,
        }
    }

    pub fn from_file<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        document_type: DocumentType,
    ) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(name, content, document_type))
    }
}

/// Status of one automation execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Waiting,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    /// Map an automation-engine status string. `Cancelling` is still in flight.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "Pending" | "PendingApproval" | "Scheduled" => ExecutionStatus::Pending,
            "Waiting" | "PendingChangeCalendarOverride" => ExecutionStatus::Waiting,
            "Success" | "CompletedWithSuccess" => ExecutionStatus::Success,
            "Failed" | "Rejected" | "CompletedWithFailure" | "ChangeCalendarOverrideRejected" => {
                ExecutionStatus::Failed
            }
            "Cancelled" => ExecutionStatus::Cancelled,
            "TimedOut" => ExecutionStatus::TimedOut,
            _ => ExecutionStatus::InProgress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }

    /// Position along Pending -> InProgress/Waiting -> terminal. Waiting and
    /// InProgress share a rank because an execution may move between them.
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::InProgress | ExecutionStatus::Waiting => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::InProgress => "InProgress",
            ExecutionStatus::Waiting => "Waiting",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::TimedOut => "TimedOut",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub reported_status: String,
    /// Failure message or current step, when the provider reports one
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Approve,
    Reject,
    StartStep,
    StopStep,
    Resume,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Approve => "Approve",
            SignalKind::Reject => "Reject",
            SignalKind::StartStep => "StartStep",
            SignalKind::StopStep => "StopStep",
            SignalKind::Resume => "Resume",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution inputs keyed by the document's declared parameter names.
/// Every value is a sequence, even when the input takes a single value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionParameters(BTreeMap<String, Vec<String>>);

impl ExecutionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), vec![value.into()]);
        self
    }

    pub fn multi<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<String>> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
}
