use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowlogError {
    #[error("Coordination service error at '{path}': {message}")]
    CoordinationService { path: String, message: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Collection failed for account '{account_id}': {message}")]
    UpstreamCollection { account_id: String, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FlowlogError {
    pub fn coordination(path: impl Into<String>, message: impl ToString) -> Self {
        Self::CoordinationService {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn collection(account_id: impl Into<String>, message: impl ToString) -> Self {
        Self::UpstreamCollection {
            account_id: account_id.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-friendly name used as the `kind` field in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CoordinationService { .. } => "coordination_service",
            Self::Upstream(_) => "upstream",
            Self::UpstreamCollection { .. } => "upstream_collection",
            Self::Archive(_) => "archive",
            Self::Dispatch(_) => "dispatch",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowlogError>;

impl From<serde_json::Error> for FlowlogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
