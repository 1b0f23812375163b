//! # conduit-exec
//!
//! Command execution subsystem for Conduit.
//! Runs an external tool's commands and keeps the bookkeeping around each call.
//!
//! ## Features
//!
//! - NDJSON framing with size limits (`FrameParser`)
//! - TTL result cache with frequency/recency eviction (`ResultCache`)
//! - Progress contexts, cancellation and heartbeats (`ProgressTracker`)
//! - Execution time and memory measurement (`PerformanceMonitor`)
//! - **Orchestration of all of the above per invocation**

pub mod cache;
pub mod command;
pub mod frame;
pub mod invoker;
pub mod monitor;
pub mod orchestrator;
pub mod progress;

// Commands
pub use command::{
    to_cli_args, validate_args, validate_command, CacheProvenance, CommandResult,
    ExecutionMetadata, InvocationId,
};

// Framing
pub use frame::{read_frames, FrameParser, FrameStats};

// Cache
pub use cache::{CacheKey, CacheStats, ResultCache};

// Progress
pub use progress::{
    ProgressHandle, ProgressReporter, ProgressSnapshot, ProgressStatus, ProgressStep,
    ProgressTracker,
};

// Monitoring
pub use monitor::{
    CommandStats, MemoryProbe, Outcome, PerfMetrics, PerfStatistics, PerfWarning, PerfWindow,
    PerformanceMonitor, ProcessMemoryProbe, Recommendation, RecommendationKind, Severity,
    WarningKind,
};

// Execution
pub use invoker::{InvokeOptions, Invoker, LocalInvoker};
pub use orchestrator::{ExecuteOptions, ExecutionOrchestrator};
