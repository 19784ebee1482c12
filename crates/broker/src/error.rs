/// Errors surfaced by a [`Broker`](crate::Broker) or
/// [`LogBroker`](crate::LogBroker) implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no responders for subject {0}")]
    NoResponders(String),

    #[error("request timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }
}
