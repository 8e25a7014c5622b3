/// Error kinds surfaced by the runtime core.
///
/// Runtime errors carry their message; memory and stack errors are
/// plain variants so the out-of-memory path never allocates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VelaError {
    /// Runtime error with a message ("table index is nil", ...)
    Runtime(String),
    /// Allocator refused a growth even after an emergency collection
    OutOfMemory,
    /// Value stack hit its configured limit
    StackOverflow,
}

impl std::fmt::Display for VelaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VelaError::Runtime(msg) => write!(f, "{}", msg),
            VelaError::OutOfMemory => write!(f, "not enough memory"),
            VelaError::StackOverflow => write!(f, "stack overflow"),
        }
    }
}

impl std::error::Error for VelaError {}

pub type VelaResult<T> = Result<T, VelaError>;

/// Shorthand for raising a runtime error with a formatted message.
#[inline]
pub fn runtime_error<T>(msg: impl Into<String>) -> VelaResult<T> {
    Err(VelaError::Runtime(msg.into()))
}
