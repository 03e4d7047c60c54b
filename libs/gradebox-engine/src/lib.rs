pub mod error;
pub mod evaluator;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod request;
pub mod sandbox;
pub mod scanner;

mod engine_tests;

pub use error::{EngineError, RegistryError, SandboxError};
pub use orchestrator::ExecutionEngine;
pub use pool::WorkerPool;
pub use registry::{LanguageProfile, LanguageRegistry};
pub use scanner::{scan, ScanVerdict};
