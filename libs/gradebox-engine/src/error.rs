use gradebox_common::types::Language;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("language '{0}' is not supported")]
    NotFound(String),

    #[error("language '{0}' is supported but not configured")]
    NotConfigured(Language),

    #[error("invalid profile for {language}: {reason}")]
    InvalidProfile { language: String, reason: String },

    #[error("failed to load language profiles")]
    Load(#[source] anyhow::Error),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_) | RegistryError::NotConfigured(_))
    }
}

/// Failures raised by an isolation backend. The detail is for operators;
/// callers only ever see a generic internal error.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),

    #[error("sandbox image '{0}' is not available")]
    ImageMissing(String),

    #[error("sandbox backend does not support {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("operation requires admin privileges")]
    Forbidden,

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("execution queue is full")]
    QueueFull,

    #[error("request {0} is already in flight")]
    DuplicateRequest(uuid::Uuid),

    #[error("worker stopped before producing a result")]
    WorkerLost,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
