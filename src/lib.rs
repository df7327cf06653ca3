//! # cachefetch
//!
//! Concurrent HTTP(S) download pipeline for a caching package proxy.
//!
//! One [`DownloadEngine`] multiplexes many fetch jobs over a small set of
//! reusable upstream connections on a single control thread. Each job
//! streams one URL into a [`DownloadItem`], a shared state machine whose
//! terminal status (and HTTP header) is what callers observe.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cachefetch::{DownloadEngine, EngineConfig, Job};
//! use cachefetch::{DownloadItem, MemorySink};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DownloadEngine::new(EngineConfig::default())?;
//!
//!     let item = DownloadItem::new(Box::new(MemorySink::default()));
//!     engine.submit(Job::new("http://deb.example.org/dists/stable/Release", item.clone())?)?;
//!     engine.run_until_idle().await;
//!
//!     println!("final state: {:?}", item.status());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod item;
pub mod pool;
pub mod sink;
pub mod transport;

pub use config::{EngineConfig, HttpConfig, PoolConfig};
pub use engine::{DownloadEngine, Job};
pub use error::{
    EngineError, FailureReason, PolicyErrorKind, Result, StatusClass, TransportErrorKind,
};
pub use http::{BodyFraming, RequestPlan, ResponseHead, ResponseParser};
pub use item::{DownloadItem, ItemFactory, ItemSink, ItemStatus, SinkVerdict};
pub use pool::{ConnectionPool, PoolStats};
pub use sink::{ControlLineSink, MemorySink, PrintItemFactory, ReportItemFactory, WriteSink};
pub use transport::{Connector, TcpConnector, Transport, TransportKey};
