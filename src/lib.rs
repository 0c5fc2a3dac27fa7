//! nova-galaxy: run Galaxy tools and workflows and follow them asynchronously.

pub mod binder;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod params;
pub mod remote;
pub mod runner;
pub mod state;
pub mod work;

pub use config::{GalaxyConfig, RunnerConfig};
pub use data::{Data, Dataset, DatasetCollection, Datastore, Outputs};
pub use error::{Error, Result};
pub use params::{ParamValue, Parameters, Scalar};
pub use remote::{GalaxyClient, RemoteService, Target, TargetKind};
pub use runner::{BasicTool, Progress, SignalChannel, SignalKind, ToolCommand, ToolRunner};
pub use state::{StateTransition, WorkState};
pub use work::{Invocation, InvocationStatus, Tool, Work, Workflow};
