use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("slot already booked: {0}")]
    AlreadyBooked(Ulid),

    #[error("slot {0} has an active booking")]
    ActiveBooking(Ulid),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("cancelled before commit")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(String),
}

/// The four outcomes a boundary layer needs to tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyBooked(_) | EngineError::ActiveBooking(_) => ErrorKind::Conflict,
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::InvalidInput,
            EngineError::Cancelled | EngineError::Storage(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let id = Ulid::new();
        assert_eq!(EngineError::NotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::AlreadyBooked(id).kind(), ErrorKind::Conflict);
        assert_eq!(EngineError::ActiveBooking(id).kind(), ErrorKind::Conflict);
        assert_eq!(EngineError::LimitExceeded("x").kind(), ErrorKind::InvalidInput);
        assert_eq!(EngineError::Storage("disk".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn display() {
        let id = Ulid::new();
        assert_eq!(
            EngineError::AlreadyBooked(id).to_string(),
            format!("slot already booked: {id}")
        );
        assert_eq!(
            EngineError::Validation("start must be before end".into()).to_string(),
            "invalid input: start must be before end"
        );
    }
}
