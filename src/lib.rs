pub mod audit;
pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod fs_util;
pub mod graph;
pub mod health;
pub mod heartbeat;
pub mod log;
pub mod mailbox;
pub mod registry;
pub mod restart;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod task;
pub mod team;
pub mod util;

pub use bridge::{Bridge, BridgeExit, BridgeSession};
pub use config::{BridgeConfig, Config, Layout, Provider};
pub use error::{Error, Result};
pub use executor::{ExecOutcome, ExecRequest, Executor};
pub use task::{TaskFile, TaskStatus, TaskStore, TaskUpdate};
pub use team::Team;
