use std::{error::Error, fmt};

const ERR_MSG_SINK_FULL: &str = "sink is full";
const ERR_MSG_SINK_CLOSED: &str = "sink is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_CANCELLED: &str = "operation cancelled";
const ERR_MSG_UNKNOWN_KEY: &str = "transaction key does not belong to this sink";

/// Why an enqueue-side operation was refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SinkFailReason {
    /// Capacity exceeded on a non-blocking or transactional enqueue.
    Full,
    /// The sink was closed; never retried by the runtime.
    Closed,
    Timeout,
    Cancelled,
    /// A transaction key issued by another sink.
    UnknownKey,
}

impl fmt::Display for SinkFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkFailReason::Full => write!(f, "{ERR_MSG_SINK_FULL}"),
            SinkFailReason::Closed => write!(f, "{ERR_MSG_SINK_CLOSED}"),
            SinkFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SinkFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SinkFailReason::UnknownKey => write!(f, "{ERR_MSG_UNKNOWN_KEY}"),
        }
    }
}

/// Enqueue failure. Ownership of the rejected value goes back to the caller
/// through `value` whenever the sink still had it.
#[derive(Debug)]
pub struct SinkError<T> {
    pub value: Option<T>,
    pub reason: SinkFailReason,
}

impl<T> SinkError<T> {
    pub fn full(value: Option<T>) -> Self {
        Self {
            value,
            reason: SinkFailReason::Full,
        }
    }

    pub fn closed(value: Option<T>) -> Self {
        Self {
            value,
            reason: SinkFailReason::Closed,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SinkFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SinkFailReason::Timeout,
        }
    }

    pub fn unknown_key() -> Self {
        Self {
            value: None,
            reason: SinkFailReason::UnknownKey,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.reason == SinkFailReason::Full
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.reason == SinkFailReason::Closed
    }

    /// Take the rejected value back out of the error.
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Re-type the error, dropping the carried value.
    pub fn discard<U>(self) -> SinkError<U> {
        SinkError {
            value: None,
            reason: self.reason,
        }
    }
}

impl<T> fmt::Display for SinkError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reason, f)
    }
}

impl<T: fmt::Debug> Error for SinkError<T> {}

/// Failure raised by a handler while processing a batch. Caught by the
/// scheduling loop; the batch counts as consumed.
#[derive(Debug)]
pub enum HandlerFault {
    Failed(anyhow::Error),
    Panicked(String),
}

impl HandlerFault {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HandlerFault::Panicked(msg)
    }
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFault::Failed(err) => write!(f, "handler failed: {err:#}"),
            HandlerFault::Panicked(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

impl Error for HandlerFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandlerFault::Failed(err) => Some(err.as_ref()),
            HandlerFault::Panicked(_) => None,
        }
    }
}

impl From<anyhow::Error> for HandlerFault {
    fn from(err: anyhow::Error) -> Self {
        HandlerFault::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_error_returns_value() {
        let err = SinkError::full(Some(7u32));
        assert!(err.is_full());
        assert_eq!(err.to_string(), ERR_MSG_SINK_FULL);
        assert_eq!(err.into_value(), Some(7));
    }

    #[test]
    fn discard_keeps_reason() {
        let err: SinkError<()> = SinkError::closed(Some(vec![1, 2])).discard();
        assert!(err.is_closed());
        assert!(err.value.is_none());
    }

    #[test]
    fn panic_payload_is_rendered() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let fault = HandlerFault::from_panic(payload);
        assert_eq!(fault.to_string(), "handler panicked: boom");
    }
}
