//! Uniform plugin shape for the checks whose bodies spec.md places
//! explicitly out of scope: kubeconform, conftest, kubepug, kyverno,
//! and the AI-summary check. Each is "pluggable" per §1 — wired against
//! the same `Check` contract `DiffCheck` uses, with its actual logic
//! left to the collaborator that owns schema/policy/deprecation/LLM
//! concerns.

use async_trait::async_trait;

use crate::scheduler::ChildAppFeedback;
use crate::types::{ApplicationStub, CheckResult, State};

use super::Check;

/// A named, always-skipped placeholder for an out-of-scope check body.
/// Exists so the scheduler's fan-out and `MessageAggregator` wiring can
/// be exercised end-to-end before a real kubeconform/conftest/kubepug/
/// kyverno/AI-summary implementation is plugged in.
pub struct StubCheck {
    name: String,
}

impl StubCheck {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Check for StubCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _app: &ApplicationStub, _feedback: &ChildAppFeedback) -> CheckResult {
        CheckResult {
            check_name: self.name.clone(),
            state: State::Skip,
            summary: format!("{} not configured", self.name),
            details: "this check's body is a pluggable collaborator; none is wired in".into(),
            no_changes_detected: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn stub_check_always_skips() {
        let check = StubCheck::new("kubeconform");
        let (tx, _rx) = mpsc::unbounded_channel();
        let feedback = ChildAppFeedback::for_test(tx);
        let app = ApplicationStub {
            name: "app1".into(),
            path: "app1".into(),
            is_helm: false,
            is_kustomize: false,
            target_revision: "main".into(),
        };
        let result = check.run(&app, &feedback).await;
        assert_eq!(result.state, State::Skip);
        assert_eq!(check.name(), "kubeconform");
    }
}
