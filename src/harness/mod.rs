// Resource harnesses: each owns one kind of provisioned resource for a run
// and is responsible for tearing it down.

pub mod document;
pub mod stack;

pub use document::{DocumentHarness, PollMode};
pub use stack::{Stack, StackHarness};
