//! `Check` plugin contract (spec.md §4.7/§4.8): every check is a pure
//! function of an affected app plus the child-app feedback callback,
//! returning one `CheckResult`. `DiffCheck` is core (it owns child-app
//! discovery); the rest (kubeconform, conftest, kubepug, kyverno,
//! AI-summary) are pluggable bodies the spec explicitly places out of
//! scope — `stub` provides the uniform shape they'd fill in.

pub mod diff;
pub mod stub;

use async_trait::async_trait;

use crate::scheduler::ChildAppFeedback;
use crate::types::{ApplicationStub, CheckResult};

/// Uniform contract every check plugin satisfies. Implementations must
/// be pure functions of `app` and the feedback callback: side effects on
/// the scheduler's work-list go through `feedback`, never direct
/// mutation, so checks stay independently testable.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, app: &ApplicationStub, feedback: &ChildAppFeedback) -> CheckResult;
}

pub use diff::{DiffCheck, RenderedManifestStore, RenderedManifests};
pub use stub::StubCheck;
