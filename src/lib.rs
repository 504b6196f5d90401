//! testorch - test execution orchestration.
//!
//! Plans test categories into dependency-ordered phases, splits individual
//! tests into time-boxed windows, and decides between phases whether a run
//! should stop early.
//!
//! - [`category`]: category registry and execution planning
//! - [`splitter`]: test discovery and window splitting
//! - [`fail_fast`]: failure classification and stop/skip decisions
//! - [`orchestrator`]: phase execution with bounded parallelism
//! - [`config`]: layered YAML/TOML configuration

pub mod category;
pub mod config;
pub mod error;
pub mod fail_fast;
pub mod metrics;
pub mod orchestrator;
pub mod persist;
pub mod splitter;

pub use category::{CategoryPriority, CategorySystem, ExecutionPlan, TestCategory};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use fail_fast::{
    FailFastMode, FailFastStrategy, FailureEvent, ImpactLevel, SkipDecision, SkipReason,
    TestFailure, ThresholdConfig,
};
pub use orchestrator::{
    CategoryExecutor, CategoryOutcome, CommandExecutor, ExecutionMode, Orchestrator, RunReport,
    RunRequest, TestLayer,
};
pub use splitter::{
    SplittingStrategy, TestExecutionWindow, TestItem, TestSplitter, WindowPriority,
};
