pub mod types;
pub mod traits;
pub mod normalizer;
pub mod fetcher;
pub mod merge;
pub mod collector;
pub mod stream_writer;
pub mod supervisor;
pub mod shutdown;
pub mod storage;
pub mod config;
pub mod pipeline;

pub use types::*;
pub use traits::PullFeed;
pub use fetcher::Fetcher;
pub use merge::merge;
pub use collector::{Collector, Polling, WorkerTotals};
pub use stream_writer::StreamWriter;
pub use supervisor::{ErrorSupervisor, SupervisorReport};
pub use shutdown::{Shutdown, ShutdownReason};
pub use storage::{Backend, MemDb, Postgres, RedisStore, Storage};
pub use config::{CliArgs, Config};
pub use pipeline::{Pipeline, PipelineReport, PipelineSettings};
