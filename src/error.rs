use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// The result type used in the entire policy crate.
pub type Result<T> = std::result::Result<T, PolicyErr>;

/// The policy crate's error type.
#[derive(Debug)]
pub enum PolicyErr {
    /// The trainer asked for recurrence but gave no memory.
    ZeroMemorySize {
        brain: String,
    },
    MemorySizeNotDivisible {
        brain: String,
        memory_size: usize,
    },
    MissingParameter {
        key: &'static str,
    },
    InvalidParameter {
        key: &'static str,
        reason: String,
    },
    DuplicateNode {
        name: String,
    },
    UnknownNode {
        name: String,
    },
    MissingFeed {
        name: String,
    },
    TensorType {
        name: String,
        expected: &'static str,
    },
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    MissingBatchField {
        key: String,
    },
    Json(serde_json::Error),
    Io(io::Error),
}

impl PolicyErr {
    /// Whether this error was raised while validating configuration, before any model exists.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PolicyErr::ZeroMemorySize { .. }
                | PolicyErr::MemorySizeNotDivisible { .. }
                | PolicyErr::MissingParameter { .. }
                | PolicyErr::InvalidParameter { .. }
        )
    }
}

impl Display for PolicyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyErr::ZeroMemorySize { brain } => write!(
                f,
                "The memory size for brain {brain} is 0 even though the trainer uses recurrent."
            ),
            PolicyErr::MemorySizeNotDivisible { brain, memory_size } => write!(
                f,
                "The memory size for brain {brain} is {memory_size} but it must be divisible by 4."
            ),
            PolicyErr::MissingParameter { key } => {
                write!(f, "The trainer parameters are missing the required key `{key}`")
            }
            PolicyErr::InvalidParameter { key, reason } => {
                write!(f, "The trainer parameter `{key}` is invalid: {reason}")
            }
            PolicyErr::DuplicateNode { name } => {
                write!(f, "A node named `{name}` is already defined in the session")
            }
            PolicyErr::UnknownNode { name } => {
                write!(f, "There's no node named `{name}` in the session")
            }
            PolicyErr::MissingFeed { name } => {
                write!(f, "The placeholder `{name}` was not fed")
            }
            PolicyErr::TensorType { name, expected } => {
                write!(f, "The tensor `{name}` is not of type {expected}")
            }
            PolicyErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch for {what}, got {got} and expected {expected}"
            ),
            PolicyErr::MissingBatchField { key } => {
                write!(f, "The batch has no field named `{key}`")
            }
            PolicyErr::Json(e) => write!(f, "json error: {e}"),
            PolicyErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for PolicyErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PolicyErr::Json(e) => Some(e),
            PolicyErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PolicyErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<io::Error> for PolicyErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
