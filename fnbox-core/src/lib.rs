//! fnbox Core Library
//!
//! Function invocation and execution engine for the fnbox serverless
//! platform. Provides the invocation router, sandbox lifecycle management,
//! container and unikernel execution backends, artifact caching and
//! configuration parsing.

pub mod backend;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod limiter;
pub mod registry;
pub mod router;
pub mod singleflight;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use backend::{BackendSet, ExecutionBackend, InvocationContext, RawOutput, SandboxHandle};
pub use cache::CodeCache;
pub use collector::{ExecutionResult, InvocationMetrics, Outcome, ResultCollector};
pub use config::{CodeSource, Config, ConfigLoader, EngineConfig};
pub use error::{FetchError, FnboxError, FnboxResult, HardValidationError, InvocationError};
pub use fetcher::{CodeFetcher, DirectoryFetcher, HttpFetcher};
pub use lifecycle::{InvocationReport, LifecycleManager};
pub use registry::{FunctionMetadata, FunctionRegistry, FunctionResolver};
pub use router::{InvocationRequest, InvocationRouter, RouterResponse};
pub use state::{InvocationState, InvocationStateMachine};
pub use types::{
    EngineKind, HandlerName, MemoryLimit, Runtime, SandboxId, StorageKey, TimeoutSecs, UserId,
};
