use thiserror::Error;

use docwriter_broker::BrokerError;
use docwriter_gateway::GatewayError;
use docwriter_render::RenderError;
use docwriter_store::StoreError;

/// Stage failure taxonomy. The kind decides the delivery's fate: validation
/// and logic failures dead-letter immediately, transient and durable
/// failures abandon and ride the broker's delivery count to the dead-letter
/// queue.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("durable: {0}")]
    Durable(String),
    #[error("logic: {0}")]
    Logic(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    DeadLetter,
    Abandon,
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "validation",
            StageError::Transient(_) => "transient",
            StageError::Durable(_) => "durable",
            StageError::Logic(_) => "logic",
            StageError::NotAuthorized(_) => "not_authorized",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            StageError::Validation(_) | StageError::Logic(_) | StageError::NotAuthorized(_) => {
                Disposition::DeadLetter
            }
            StageError::Transient(_) | StageError::Durable(_) => Disposition::Abandon,
        }
    }
}

impl From<GatewayError> for StageError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::RateLimited { .. } | GatewayError::Transient(_) => {
                StageError::Transient(err.to_string())
            }
            GatewayError::Fatal(_) => StageError::Durable(err.to_string()),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotAuthorized { .. } => StageError::NotAuthorized(err.to_string()),
            StoreError::InvalidKey(_) => StageError::Logic(err.to_string()),
            StoreError::Json(_) => StageError::Validation(err.to_string()),
            StoreError::VersionConflict { .. } => StageError::Transient(err.to_string()),
            StoreError::NotFound(_) | StoreError::Io(_) => StageError::Durable(err.to_string()),
        }
    }
}

impl From<BrokerError> for StageError {
    fn from(err: BrokerError) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<RenderError> for StageError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Transient(_) => StageError::Transient(err.to_string()),
            RenderError::Fatal(_) | RenderError::Archive(_) => StageError::Durable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_logic_dead_letter() {
        assert_eq!(
            StageError::Validation("bad".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            StageError::Logic("invariant".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            StageError::NotAuthorized("owner".into()).disposition(),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn external_failures_abandon_for_redelivery() {
        assert_eq!(
            StageError::from(GatewayError::Transient("503".into())).disposition(),
            Disposition::Abandon
        );
        assert_eq!(
            StageError::from(GatewayError::Fatal("schema".into())).disposition(),
            Disposition::Abandon
        );
    }

    #[test]
    fn store_errors_map_by_kind() {
        let err = StageError::from(StoreError::NotAuthorized {
            owner_id: "u2".into(),
            job_id: "j1".into(),
        });
        assert_eq!(err.kind(), "not_authorized");
        assert_eq!(
            StageError::from(StoreError::NotFound("blob".into())).kind(),
            "durable"
        );
    }
}
