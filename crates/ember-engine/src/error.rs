use crate::ElementType;
use std::fmt;

/// Status class of an [`EngineError`]
///
/// Callers that only care whether a failure came from configuration, bad
/// arguments, memory, the device or contention match on this instead of the
/// full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Configuration,
    InvalidArgument,
    AllocationFailure,
    DeviceExecution,
    SessionBusy,
}

/// Error type for engine operations
#[derive(Debug, Clone)]
pub enum EngineError {
    KernelNotFound {
        op_type: String,
        domain: String,
        version: i64,
        provider: String,
    },
    AmbiguousKernel {
        op_type: String,
        domain: String,
        provider: String,
    },
    UnsupportedType(ElementType),
    UnassignableNode {
        node: String,
        op_type: String,
    },
    Configuration(String),
    InvalidGraph(String),
    InvalidArgument(String),
    AllocationFailure {
        requested: usize,
        allocator: String,
        reason: String,
    },
    DeviceExecution(String),
    Timeout {
        node: String,
        timeout_ms: u64,
    },
    SessionBusy,
    Aggregate(Vec<EngineError>),
    Io(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::KernelNotFound { .. }
            | EngineError::AmbiguousKernel { .. }
            | EngineError::UnassignableNode { .. }
            | EngineError::Configuration(_)
            | EngineError::InvalidGraph(_)
            | EngineError::Io(_) => ErrorCode::Configuration,
            EngineError::UnsupportedType(_) | EngineError::InvalidArgument(_) => {
                ErrorCode::InvalidArgument
            }
            EngineError::AllocationFailure { .. } => ErrorCode::AllocationFailure,
            EngineError::DeviceExecution(_) | EngineError::Timeout { .. } => {
                ErrorCode::DeviceExecution
            }
            EngineError::SessionBusy => ErrorCode::SessionBusy,
            // an aggregate is classified by its first member
            EngineError::Aggregate(errors) => errors
                .first()
                .map(|e| e.code())
                .unwrap_or(ErrorCode::DeviceExecution),
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_graph(msg: impl Into<String>) -> Self {
        EngineError::InvalidGraph(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::KernelNotFound {
                op_type,
                domain,
                version,
                provider,
            } => write!(
                f,
                "no kernel for {}:{} version {} on provider {}",
                display_domain(domain),
                op_type,
                version,
                provider
            ),
            EngineError::AmbiguousKernel {
                op_type,
                domain,
                provider,
            } => write!(
                f,
                "ambiguous kernel registration for {}:{} on provider {}",
                display_domain(domain),
                op_type,
                provider
            ),
            EngineError::UnsupportedType(ty) => write!(f, "unsupported element type: {}", ty),
            EngineError::UnassignableNode { node, op_type } => {
                write!(f, "no provider can execute node {} ({})", node, op_type)
            }
            EngineError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            EngineError::InvalidGraph(msg) => write!(f, "invalid graph: {}", msg),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            EngineError::AllocationFailure {
                requested,
                allocator,
                reason,
            } => write!(
                f,
                "allocation of {} bytes from {} failed: {}",
                requested, allocator, reason
            ),
            EngineError::DeviceExecution(msg) => write!(f, "device execution error: {}", msg),
            EngineError::Timeout { node, timeout_ms } => {
                write!(f, "node {} exceeded the run timeout of {} ms", node, timeout_ms)
            }
            EngineError::SessionBusy => write!(f, "session is busy with another run"),
            EngineError::Aggregate(errors) => {
                write!(f, "{} errors:", errors.len())?;
                for (i, e) in errors.iter().enumerate() {
                    write!(f, " [{}] {}", i, e)?;
                }
                Ok(())
            }
            EngineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

fn display_domain(domain: &str) -> &str {
    if domain.is_empty() { "ai.onnx" } else { domain }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Configuration(format!("JSON: {}", e))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors collected during one run
///
/// Asynchronous device failures land here as they are observed and are
/// surfaced together when the run completes.
#[derive(Debug, Default)]
pub(crate) struct ErrorSink {
    errors: Vec<EngineError>,
}

impl ErrorSink {
    pub fn push(&mut self, error: EngineError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(EngineError::Aggregate(self.errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_implements_error_trait() {
        fn assert_error<T: std::error::Error>(_: &T) {}
        assert_error(&EngineError::SessionBusy);
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::KernelNotFound {
            op_type: "Conv".to_string(),
            domain: String::new(),
            version: 11,
            provider: "gpu".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("ai.onnx:Conv"));
        assert!(display.contains("gpu"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::UnassignableNode {
                node: "n".into(),
                op_type: "Foo".into()
            }
            .code(),
            ErrorCode::Configuration
        );
        assert_eq!(
            EngineError::invalid_argument("x").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            EngineError::Timeout {
                node: "n".into(),
                timeout_ms: 5
            }
            .code(),
            ErrorCode::DeviceExecution
        );
        assert_eq!(EngineError::SessionBusy.code(), ErrorCode::SessionBusy);
    }

    #[test]
    fn test_error_sink_collation() {
        let sink = ErrorSink::default();
        assert!(sink.into_result().is_ok());

        let mut sink = ErrorSink::default();
        sink.push(EngineError::DeviceExecution("a".into()));
        assert!(matches!(
            sink.into_result(),
            Err(EngineError::DeviceExecution(_))
        ));

        let mut sink = ErrorSink::default();
        sink.push(EngineError::DeviceExecution("a".into()));
        sink.push(EngineError::DeviceExecution("b".into()));
        match sink.into_result() {
            Err(EngineError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {:?}", other),
        }
    }
}
