//! cmdbridge — run external command-line tools through a separate executor
//!
//! The caller side ([`Dispatcher`]) hands out correlation ids, applies
//! timeouts (with a heartbeat for streaming calls that report progress),
//! and retries once when the transport drops. The executor side
//! ([`Executor`]) resolves executables on PATH, runs them in buffered or
//! streaming mode, forwards progress, and kills whole process trees.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod process_tree;
pub mod protocol;
pub mod redact;
pub mod resolver;
pub mod transport;

pub use config::{load_config, BridgeConfig, DispatcherConfig, ExecutorConfig};
pub use dispatcher::{Dispatcher, InvokeOptions, ProgressSink, Timeout};
pub use error::{BridgeError, Result};
pub use executor::Executor;
pub use process_tree::{ProcessInspector, SystemProcessTree};
pub use protocol::{CorrelationId, ProgressEvent, Request};
pub use resolver::PathResolver;
pub use transport::{LocalTransport, PipeTransport, Transport};
