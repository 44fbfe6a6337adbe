//! tool_tracker - Tool execution tracking for streamed chat responses
//!
//! The server announces tool use in prose. `markers` turns fragments into
//! matches, `execution` holds the per-execution state machine and `tracker`
//! ties both together with timers and a typed event topic.

pub mod execution;
pub mod markers;
pub mod tracker;

pub use execution::{ToolEvent, ToolExecution, ToolStatus, TransitionError};
pub use markers::{contains_marker_glyph, MarkerMatch, MarkerRule, MarkerTable, MARKER_TABLE_VERSION};
pub use tracker::{ResultAggregator, ToolExecutionEvent, ToolExecutionTracker};
