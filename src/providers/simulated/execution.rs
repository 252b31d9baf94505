use statig::prelude::*;

use super::workflow::BoundStep;
use crate::providers::types::{ExecutionStatus, SignalKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Start,
    /// Run the current step if it completes on its own
    Advance,
    /// An externally awaited step finished
    StepSettled { outcome: Result<(), String> },
    Signal(SignalKind),
    Cancel,
    /// The provider-enforced wait limit of a paused step elapsed
    WaitExpired,
}

/// Context of one simulated execution
pub struct ExecutionMachine {
    pub execution_id: String,
    steps: Vec<BoundStep>,
    cursor: usize,
    role_error: Option<String>,
    failure: Option<String>,
}

impl ExecutionMachine {
    pub fn new(execution_id: String, steps: Vec<BoundStep>, role_error: Option<String>) -> Self {
        Self {
            execution_id,
            steps,
            cursor: 0,
            role_error,
            failure: None,
        }
    }

    pub fn current_step(&self) -> Option<&BoundStep> {
        self.steps.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn fail(&mut self, message: String) -> Outcome<State> {
        tracing::info!(
            execution_id = %self.execution_id,
            step = self.cursor,
            reason = %message,
            "Simulated execution failed"
        );
        self.failure = Some(message);
        Transition(State::failed())
    }

    fn complete_step(&mut self) {
        self.cursor += 1;
    }
}

#[state_machine(initial = "State::pending()")]
impl ExecutionMachine {
    #[state]
    fn pending(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        match event {
            ExecutionEvent::Start => match self.role_error.take() {
                Some(message) => self.fail(message),
                None => Transition(State::in_progress()),
            },
            ExecutionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn in_progress(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        match event {
            ExecutionEvent::Advance => match self.current_step().cloned() {
                None => {
                    tracing::info!(execution_id = %self.execution_id, "Simulated execution succeeded");
                    Transition(State::success())
                }
                Some(BoundStep::Approve { name, approvers }) => {
                    if approvers.is_empty() {
                        self.fail(format!("Step {name} has no approvers"))
                    } else {
                        tracing::info!(
                            execution_id = %self.execution_id,
                            step = %name,
                            approvers = ?approvers,
                            "Waiting for approval"
                        );
                        Transition(State::awaiting_approval())
                    }
                }
                Some(BoundStep::Pause { .. }) => Transition(State::paused()),
                Some(BoundStep::Instant { .. }) => {
                    self.complete_step();
                    Handled
                }
                // completes through StepSettled once the stack is gone
                Some(BoundStep::DeleteStack { .. }) => Handled,
            },
            ExecutionEvent::StepSettled { outcome } => match outcome {
                Ok(()) => {
                    self.complete_step();
                    Handled
                }
                Err(message) => self.fail(message.clone()),
            },
            ExecutionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn awaiting_approval(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        match event {
            ExecutionEvent::Signal(SignalKind::Approve) => {
                self.complete_step();
                Transition(State::in_progress())
            }
            ExecutionEvent::Signal(SignalKind::Reject) => {
                let step = self
                    .current_step()
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();
                self.fail(format!("Step {step} was rejected"))
            }
            ExecutionEvent::WaitExpired => Transition(State::timed_out()),
            ExecutionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn paused(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        match event {
            ExecutionEvent::Signal(SignalKind::Resume) => {
                self.complete_step();
                Transition(State::in_progress())
            }
            ExecutionEvent::WaitExpired => Transition(State::timed_out()),
            ExecutionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn success(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn failed(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn cancelled(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn timed_out(&mut self, event: &ExecutionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

/// A running execution: the state machine plus its externally visible status
pub struct SimulatedExecution {
    machine: StateMachine<ExecutionMachine>,
}

impl SimulatedExecution {
    pub fn start(context: ExecutionMachine) -> Self {
        let mut machine = context.state_machine();
        machine.handle(&ExecutionEvent::Start);
        Self { machine }
    }

    pub fn handle(&mut self, event: ExecutionEvent) -> ExecutionStatus {
        let before = self.status();
        self.machine.handle(&event);
        let after = self.status();
        if before != after {
            tracing::debug!(
                execution_id = %self.machine.inner().execution_id,
                from = %before,
                to = %after,
                event = ?event,
                "Simulated execution transition"
            );
        }
        after
    }

    pub fn status(&self) -> ExecutionStatus {
        match self.machine.state() {
            State::Pending { .. } => ExecutionStatus::Pending,
            State::InProgress { .. } => ExecutionStatus::InProgress,
            State::AwaitingApproval { .. } | State::Paused { .. } => ExecutionStatus::Waiting,
            State::Success { .. } => ExecutionStatus::Success,
            State::Failed { .. } => ExecutionStatus::Failed,
            State::Cancelled { .. } => ExecutionStatus::Cancelled,
            State::TimedOut { .. } => ExecutionStatus::TimedOut,
        }
    }

    pub fn context(&self) -> &ExecutionMachine {
        self.machine.inner()
    }

    /// Detail string reported alongside the status
    pub fn detail(&self) -> Option<String> {
        let context = self.context();
        if let Some(failure) = context.failure() {
            return Some(failure.to_string());
        }
        if self.status().is_terminal() {
            return None;
        }
        context
            .current_step()
            .map(|step| format!("current step: {}", step.name()))
    }
}
