pub mod access;
pub mod adaptive;
pub mod alerts;
pub mod archiver;
mod background;
pub mod compressor;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod optimizer;
pub mod pipeline;
pub mod prefetch;
mod placement;
pub mod providers;
pub mod queue;
pub mod registry;
pub mod repair;
pub mod vault;
pub mod verifier;

pub use alerts::{AlertGate, LogAlertSink, MemoryAlertSink};
pub use background::BackgroundTasks;
pub use config::EngineConfig;
pub use context::StorageContext;
pub use vault::{Collaborators, TraceVault};
