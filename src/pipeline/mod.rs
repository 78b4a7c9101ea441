pub mod coordinator;
pub mod member;
pub mod metrics;
pub mod offsets;
pub mod retry;

pub use coordinator::{Coordinator, PipelineError, PipelineSettings, PipelineState};
pub use member::Member;
pub use metrics::{PipelineMetrics, PipelineReport};
pub use offsets::OffsetTracker;
pub use retry::RetryPolicy;
