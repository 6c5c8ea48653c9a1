//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A record failed validation against the target system's rules
    #[error("Validation failed for {entity}: {message}")]
    Validation { entity: String, message: String },

    /// Source API signalled throttling (HTTP 429 or equivalent)
    #[error("Rate limit exceeded{}", retry_after_secs.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default())]
    RateLimitExceeded { retry_after_secs: Option<u64> },

    /// A fetch returned at least as many records as the API allows per call
    #[error("API record limit reached: {returned} records returned (limit {limit})")]
    ApiLimitExceeded { returned: usize, limit: usize },

    /// Transport or server-side failure that may succeed on retry
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Circuit breaker rejected the call without executing it
    #[error("Circuit '{0}' is open - call rejected")]
    CircuitOpen(String),

    /// Post-migration integrity check failed
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Unexpected failure during a mutating phase
    #[error("Critical failure in {phase}: {message}")]
    Critical { phase: String, message: String },

    /// Source API returned an unusable response
    #[error("Source API error: {0}")]
    Source(String),

    /// Target system rejected an operation
    #[error("Target error for {entity}: {message}")]
    Target { entity: String, message: String },

    /// Record not found in the target system
    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    /// Another run already holds the lock for this scope
    #[error("Scope '{scope}' is locked by another run (lock file: {path})")]
    ScopeLocked { scope: String, path: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Validation error
    pub fn validation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Validation {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a Target error
    pub fn target(entity: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Target {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a Critical error for the given phase
    pub fn critical(phase: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Critical {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        MigrateError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Transient errors count toward circuit breaker thresholds.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MigrateError::TransientNetwork(_) | MigrateError::RateLimitExceeded { .. }
        )
    }

    /// Whether the error must abort the current pass instead of being
    /// recorded against a single record or chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Critical { .. }
                | MigrateError::Cancelled
                | MigrateError::Io(_)
                | MigrateError::State(_)
                | MigrateError::ScopeLocked { .. }
        )
    }

    /// Short machine-readable kind, used in audit entries and report tallies.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Config(_) => "config",
            MigrateError::Validation { .. } => "validation_error",
            MigrateError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            MigrateError::ApiLimitExceeded { .. } => "api_limit_exceeded",
            MigrateError::TransientNetwork(_) => "transient_network",
            MigrateError::CircuitOpen(_) => "circuit_open",
            MigrateError::IntegrityViolation(_) => "integrity_violation",
            MigrateError::Critical { .. } => "critical_failure",
            MigrateError::Source(_) => "source",
            MigrateError::Target { .. } => "target",
            MigrateError::NotFound { .. } => "not_found",
            MigrateError::ScopeLocked { .. } => "scope_locked",
            MigrateError::State(_) => "state",
            MigrateError::Io(_) => "io",
            MigrateError::Yaml(_) => "yaml",
            MigrateError::Json(_) => "json",
            MigrateError::Cancelled => "cancelled",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Validation { .. } => 3,
            MigrateError::IntegrityViolation(_) => 4,
            MigrateError::ScopeLocked { .. } => 5,
            MigrateError::RateLimitExceeded { .. }
            | MigrateError::TransientNetwork(_)
            | MigrateError::CircuitOpen(_) => 6,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
