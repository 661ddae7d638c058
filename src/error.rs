use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

/// Coarse classification of a [`HubError`], used by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("planet '{planet_id}' not found on agent '{agent_id}'")]
    PlanetNotFound { agent_id: String, planet_id: String },

    #[error("variant '{variant_id}' not found in history of planet '{planet_id}'")]
    VariantNotFound {
        planet_id: String,
        variant_id: String,
    },

    #[error("no optimization task is running for '{0}'")]
    TaskNotFound(String),

    #[error("optimization is already running for '{0}'")]
    AlreadyRunning(String),

    #[error("agent '{0}' already exists")]
    AgentExists(String),

    #[error("evaluator failed: {0}")]
    Evaluator(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn validation(message: impl Into<String>) -> Self {
        HubError::Validation(message.into())
    }

    pub fn planet_not_found(agent_id: &str, planet_id: &str) -> Self {
        HubError::PlanetNotFound {
            agent_id: agent_id.to_string(),
            planet_id: planet_id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Validation(_) => ErrorKind::Validation,
            HubError::AgentNotFound(_)
            | HubError::PlanetNotFound { .. }
            | HubError::VariantNotFound { .. }
            | HubError::TaskNotFound(_) => ErrorKind::NotFound,
            HubError::AlreadyRunning(_) | HubError::AgentExists(_) => ErrorKind::Conflict,
            HubError::Evaluator(_) | HubError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
