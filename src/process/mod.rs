//! Consumer process management
//!
//! Consumers run as separate OS processes. Each one keeps a record in a
//! shared registry ([`ConsumerProcessManager`]) that administrative commands
//! read concurrently; a [`Supervisor`] can run several of them and restart
//! the ones that die.

pub mod error;
pub mod manager;
pub mod record;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use error::{ProcessError, ProcessResult};
pub use manager::{
    ConsumerProcessManager, HeartbeatStats, ProcessRegistration, ProcessStatistics, ProcessView,
};
pub use record::{ConsumerProcessRecord, ProcessStatus};
pub use store::{FileProcessStore, MemoryProcessStore, ProcessStore};
pub use supervisor::{RestartBudget, Supervisor, SupervisorConfig, SupervisorReport};
pub use worker::{ConsumerExit, ConsumerProcess};
