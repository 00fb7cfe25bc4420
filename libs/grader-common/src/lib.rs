pub mod cache;
pub mod config;
pub mod progress;
pub mod redis;
pub mod types;

// Re-export commonly used types for convenience
pub use cache::{CacheError, CacheStore, MemoryCache, RedisCache};
pub use config::Config;
pub use progress::{GradingStateStore, RunLease};
pub use types::{
    CriterionData, CriterionFailure, CriterionGrade, CriterionOutcome, FeedbackItem,
    GradingEvent, GradingProgress, GradingRequest, Location, Marker, PluginKind, Stage,
    SubmissionOutcome,
};
