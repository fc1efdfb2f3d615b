use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Object reference not set to an instance of an object.")]
    NullReference,
    #[error("Value cannot be null. (Parameter '{0}')")]
    ArgumentNull(&'static str),
    #[error("Specified argument was out of the range of valid values. (Parameter '{param}'): {reason}")]
    ArgumentOutOfRange { param: &'static str, reason: String },
    #[error("Invalid type handle")]
    NullTypeHandle,
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("Access of {size} bytes at offset {offset} is outside the {length}-byte payload of {type_name}")]
    OutOfBounds {
        type_name: String,
        offset: usize,
        size: usize,
        length: usize,
    },
    #[error("Offset {offset} of {type_name} holds an object reference that other data may not overlap")]
    ReferenceOverlap { type_name: String, offset: usize },
    #[error("Index {index} out of bounds (length {length})")]
    IndexOutOfRange { index: usize, length: usize },
    #[error("Type {0} does not provide a value-based hash code")]
    HashNotSupported(String),
    #[error("No parameterless constructor defined for type '{0}'.")]
    MissingDefaultConstructor(String),
    #[error("Cannot create an instance of {0} because it is an abstract class or interface.")]
    InvalidAllocation(String),
    #[error("Handle is not initialized.")]
    InvalidHandle,
    #[error("Insufficient memory to continue the execution of the program.")]
    OutOfMemory,
}

impl RuntimeError {
    pub fn out_of_range(param: &'static str, reason: impl Into<String>) -> Self {
        Self::ArgumentOutOfRange {
            param,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DumpError {
    #[error("Dump truncated: needed {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Negative frame count: {0}")]
    NegativeFrameCount(i32),
    #[error("Frame data is {actual} bytes, header declares {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Unknown dump signature {0:#010x}")]
    BadSignature(u32),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
