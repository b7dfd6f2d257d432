//! fmha error types

/// fmha result type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], for callers that branch on the kind of
/// failure rather than its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Inputs violate a shape/stride/dtype/device precondition of the call.
    PreconditionViolation,
    /// The selected kernel instance cannot run this problem.
    UnsupportedConfiguration,
    /// A runtime value has no compiled specialization.
    UnmappedDispatchValue,
    /// The backward pass was compiled out.
    BackwardDisabled,
    /// Misuse of the tensor stand-in or operator table.
    InvalidArgument,
    /// A launched job failed on the device.
    DeviceFault,
}

/// fmha errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape, stride, dtype or device mismatch detected before any device work
    #[error("precondition violated for '{arg}': {reason}")]
    PreconditionViolation {
        /// Offending argument
        arg: &'static str,
        /// What was expected
        reason: String,
    },

    /// A kernel instance rejected the problem in its feasibility check
    #[error("{instance} does not support this problem: {reason}")]
    UnsupportedConfiguration {
        /// Type string of the kernel instance
        instance: String,
        /// Which check failed
        reason: String,
    },

    /// Runtime value outside the compiled dispatch matrix
    #[error("{what}: {value}")]
    UnmappedDispatchValue {
        /// Message naming the dispatch axis
        what: &'static str,
        /// The value that was not mapped
        value: String,
    },

    /// Backward was disabled via the `disable-backward` feature
    #[error("fmha backward has been disabled at build time")]
    BackwardDisabled,

    /// Invalid argument to a tensor or table operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Operator name not present in the operator table
    #[error("unknown operator '{name}'")]
    UnknownOperator {
        /// Requested name
        name: String,
    },

    /// Work issued on a stream failed; reported at synchronization
    #[error("device fault: {reason}")]
    DeviceFault {
        /// Description of the fault
        reason: String,
    },
}

impl Error {
    /// Shorthand for [`Error::PreconditionViolation`].
    pub fn precondition(arg: &'static str, reason: impl Into<String>) -> Self {
        Error::PreconditionViolation {
            arg,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::InvalidArgument`].
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PreconditionViolation { .. } => ErrorKind::PreconditionViolation,
            Error::UnsupportedConfiguration { .. } => ErrorKind::UnsupportedConfiguration,
            Error::UnmappedDispatchValue { .. } => ErrorKind::UnmappedDispatchValue,
            Error::BackwardDisabled => ErrorKind::BackwardDisabled,
            Error::InvalidArgument { .. } | Error::UnknownOperator { .. } => {
                ErrorKind::InvalidArgument
            }
            Error::DeviceFault { .. } => ErrorKind::DeviceFault,
        }
    }
}
