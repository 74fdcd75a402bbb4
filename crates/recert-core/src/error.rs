use std::path::PathBuf;

/// Errors that can occur across the recertification engine.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate converts to `miette::Report` at the boundary.
///
/// # Examples
///
/// ```
/// use recert_core::RecertError;
///
/// let err = RecertError::Config("unknown provider".into());
/// assert!(err.to_string().contains("unknown provider"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RecertError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(code(recert::config), help("check .recert.toml, or run `recert init` for a template"))]
    Config(String),

    /// A glob in a policy or assignment rule could not be compiled.
    #[error("invalid glob '{pattern}': {reason}")]
    #[diagnostic(code(recert::pattern))]
    Pattern {
        /// The offending glob text.
        pattern: String,
        /// Why the glob was rejected.
        reason: String,
    },

    /// Local git repository access failure.
    #[error("git error: {0}")]
    Git(String),

    /// Remote Git hosting backend failure.
    #[error("{provider} error: {message}")]
    #[diagnostic(code(recert::provider))]
    Provider {
        /// Backend name (`github`, `azure`, `gitlab`).
        provider: &'static str,
        /// Backend-specific failure description.
        message: String,
    },

    /// Assignment or strategy plugin failure.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A review unit produced no content changes to commit.
    #[error("review unit '{0}' has no content changes to commit")]
    NothingToCommit(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl RecertError {
    /// Build a [`RecertError::Provider`] from any displayable failure.
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        RecertError::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Whether this error comes from invalid configuration rather than runtime I/O.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RecertError::Config(_) | RecertError::Pattern { .. } | RecertError::Toml(_)
        )
    }
}
