use std::sync::Arc;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A cloneable handle to an error raised by user code.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// The content of an exchange's exception slot.
///
/// Faults raised during a traversal are recorded here instead of being
/// propagated across the callback boundary. Error-handling processors and the
/// caller of the outermost route inspect the slot once the callback fires.
#[derive(Error, Debug, Clone)]
pub enum ProcessingError {
    #[error("Processor '{processor}' failed: {source}")]
    Failed {
        processor: String,
        #[source]
        source: SharedError,
    },

    #[error("Processor '{processor}' panicked: {message}")]
    Panicked { processor: String, message: String },

    #[error("Exchange was interrupted: {reason}")]
    Interrupted { reason: String },

    #[error("Unit of work failed with {} caused exceptions.", failures.len())]
    SubUnitOfWork { failures: Vec<ProcessingError> },

    #[error("Sequential processing failed for number {index}.")]
    Split {
        index: usize,
        #[source]
        source: Box<ProcessingError>,
    },

    #[error("Multicast processing failed for number {index}.")]
    Multicast {
        index: usize,
        #[source]
        source: Box<ProcessingError>,
    },

    #[error("No consumer available on endpoint '{uri}'.")]
    NoConsumer { uri: String },

    #[error("Processor '{processor}' is not started and rejected the exchange.")]
    Rejected { processor: String },
}

impl ProcessingError {
    #[inline]
    pub fn failed(processor: impl Into<String>, err: impl Into<BoxError>) -> Self {
        Self::Failed {
            processor: processor.into(),
            source: Arc::from(err.into()),
        }
    }

    #[inline]
    pub fn panicked(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Panicked {
            processor: processor.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self::Interrupted {
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn split(index: usize, source: ProcessingError) -> Self {
        Self::Split {
            index,
            source: Box::new(source),
        }
    }

    #[inline]
    pub fn multicast(index: usize, source: ProcessingError) -> Self {
        Self::Multicast {
            index,
            source: Box::new(source),
        }
    }

    #[inline]
    pub fn no_consumer(uri: impl Into<String>) -> Self {
        Self::NoConsumer { uri: uri.into() }
    }

    #[inline]
    pub fn rejected(processor: impl Into<String>) -> Self {
        Self::Rejected {
            processor: processor.into(),
        }
    }

    /// Converts a panic payload into a readable message.
    pub(crate) fn from_panic(
        processor: impl Into<String>,
        payload: Box<dyn std::any::Any + Send>,
    ) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            String::from("unknown panic payload")
        };
        Self::panicked(processor, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_failed_keeps_source() {
        let err = ProcessingError::failed("parse", "bad input");
        assert_eq!(err.to_string(), "Processor 'parse' failed: bad input");
        assert!(err.source().is_some());
        // clones share the same source
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn test_panic_payload_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let err = ProcessingError::from_panic("p1", payload);
        assert_eq!(err.to_string(), "Processor 'p1' panicked: boom");
    }

    #[test]
    fn test_split_wraps_cause() {
        let err = ProcessingError::split(1, ProcessingError::no_consumer("direct:x"));
        assert_eq!(err.to_string(), "Sequential processing failed for number 1.");
        assert!(err.source().unwrap().to_string().contains("direct:x"));
    }
}
