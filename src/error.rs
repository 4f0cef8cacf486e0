//! Error types for remote-platform calls and upgrade steps.

use thiserror::Error;

/// A failed call against the remote platform.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The client binary could not be launched at all.
    #[error("failed to launch `{command}`: {detail}")]
    Spawn { command: String, detail: String },

    /// The call did not return within its deadline.
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// The call returned a non-zero exit status.
    #[error("`{command}` failed: {stderr}")]
    Failed {
        command: String,
        stderr: String,
        stdout: String,
    },

    /// The call succeeded but its output was not what the caller requires.
    #[error("`{command}` returned an unexpected response: {detail}")]
    Unexpected { command: String, detail: String },

    /// A resource top-up needed to unblock the call could not be sent.
    #[error("resource top-up for {address} failed: {detail}")]
    TopUpFailed { address: String, detail: String },
}

impl RpcError {
    /// All error text the platform produced, for signature matching.
    pub fn text(&self) -> String {
        match self {
            RpcError::Failed { stderr, stdout, .. } => format!("{stderr} {stdout}"),
            other => other.to_string(),
        }
    }
}

/// The upgrade step a node failed in. Each maps onto one `Failed_*` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resolve,
    MaintenanceOn,
    Drain,
    Snapshot,
    Deploy,
    Start,
    MaintenanceGate,
    StartTimer,
    MaintenanceOff,
    Health,
    Version,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Resolve => "resolve",
            Step::MaintenanceOn => "maintenance on",
            Step::Drain => "drain",
            Step::Snapshot => "snapshot",
            Step::Deploy => "deploy",
            Step::Start => "start",
            Step::MaintenanceGate => "maintenance gate",
            Step::StartTimer => "start timer",
            Step::MaintenanceOff => "maintenance off",
            Step::Health => "health",
            Step::Version => "version verification",
        }
    }
}

/// A step-level failure, carrying enough context to name the failed state.
#[derive(Debug, Clone, Error)]
#[error("{} step failed: {message}", .step.name())]
pub struct StepError {
    pub step: Step,
    pub message: String,
}

impl StepError {
    pub fn new(step: Step, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_text_includes_both_streams() {
        let err = RpcError::Failed {
            command: "dfx canister status abc".into(),
            stderr: "Error: IC0508".into(),
            stdout: "partial".into(),
        };
        let text = err.text();
        assert!(text.contains("IC0508"));
        assert!(text.contains("partial"));
    }

    #[test]
    fn timeout_text_mentions_timed_out() {
        let err = RpcError::Timeout {
            command: "dfx deploy".into(),
            secs: 30,
        };
        assert!(err.text().contains("timed out"));
    }

    #[test]
    fn step_error_names_step() {
        let err = StepError::new(Step::Snapshot, "no id");
        assert_eq!(err.to_string(), "snapshot step failed: no id");
    }
}
