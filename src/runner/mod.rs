//! Signal-driven tool runner.

pub mod basic_tool;
pub mod signals;
pub mod tool_runner;

pub use basic_tool::BasicTool;
pub use signals::{CommandHandler, Progress, SignalChannel, SignalKind, ToolCommand};
pub use tool_runner::{StoreNameFn, ToolRunner};
