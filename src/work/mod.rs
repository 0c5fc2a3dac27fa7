//! Execution of tools and workflows.

pub mod facade;
pub mod invocation;

pub use facade::{Tool, Work, Workflow};
pub use invocation::{CANCELLED_BY_USER, Invocation, InvocationStatus};
