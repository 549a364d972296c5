pub mod preview;
pub mod repository;
pub mod retention;
pub mod scheduler;
pub mod scope;
pub mod service;

pub use preview::{PreviewError, PreviewEvaluator, PreviewMatch, PreviewOutcome};
pub use repository::{
    JobProgress, JobRecordError, JobStatus, NewRuleApplicationJob, RuleApplicationJob,
    RuleApplicationJobRepository,
};
pub use retention::run_retention_sweeper;
pub use scheduler::{ApplicationPlan, BatchError, BatchRunner};
pub use scope::{ContainerScope, ItemRef, JobProgressStore, RuleTargetStore, StoreError};
pub use service::{INTERRUPTED_ERROR, RuleApplicationService, ServiceError, StartedJob};
