//! Error types for the basalt compiler.
//!
//! This module defines the error type used throughout the compiler pipeline,
//! from IR parsing through optimisation and code generation. The variants
//! follow the pipeline stages: errors raised while reading textual IR are
//! user errors, everything after a successful verify is an internal error.

use std::error::Error;
use std::fmt;
use std::string::FromUtf8Error;

/// Main error type for the basalt compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasaltError {
    /// Errors encountered during IR parsing.
    ParsingError(String),
    /// A module or function violated an IR invariant.
    VerifierError(String),
    /// Misuse of the IR builder (emitting into a closed block, type mismatch).
    BuilderError(String),
    /// An optimisation pass refused or failed.
    OptError(String),
    /// Errors during instruction selection or register allocation.
    CodegenError(String),
    /// Errors while building or serialising an object file.
    ObjectError(String),
    /// I/O errors when reading or writing files.
    IoError(String),
    /// UTF-8 encoding errors.
    Utf8Error(String),
    /// Internal compiler errors indicating bugs.
    InternalError(String),
}

impl fmt::Display for BasaltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasaltError::ParsingError(msg) => write!(f, "Parsing Error: {}", msg),
            BasaltError::VerifierError(msg) => write!(f, "Verifier Error: {}", msg),
            BasaltError::BuilderError(msg) => write!(f, "Builder Error: {}", msg),
            BasaltError::OptError(msg) => write!(f, "Optimisation Error: {}", msg),
            BasaltError::CodegenError(msg) => write!(f, "Codegen Error: {}", msg),
            BasaltError::ObjectError(msg) => write!(f, "Object Error: {}", msg),
            BasaltError::IoError(msg) => write!(f, "IO Error: {}", msg),
            BasaltError::Utf8Error(msg) => write!(f, "UTF8 Error: {}", msg),
            BasaltError::InternalError(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

impl Error for BasaltError {}

impl From<std::io::Error> for BasaltError {
    fn from(err: std::io::Error) -> Self {
        BasaltError::IoError(err.to_string())
    }
}

impl From<FromUtf8Error> for BasaltError {
    fn from(err: FromUtf8Error) -> Self {
        BasaltError::Utf8Error(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, BasaltError>;

impl BasaltError {
    /// Whether this error is a user error (bad input) rather than a bug.
    ///
    /// The driver maps user errors to exit code 1 and everything else to 2.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BasaltError::ParsingError(_) | BasaltError::IoError(_) | BasaltError::Utf8Error(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = BasaltError::ParsingError("unexpected token".to_string());
        assert_eq!(format!("{}", err), "Parsing Error: unexpected token");
        let err = BasaltError::VerifierError("block b1 has no terminator".to_string());
        assert_eq!(
            format!("{}", err),
            "Verifier Error: block b1 has no terminator"
        );
    }

    #[test]
    fn test_user_error_classification() {
        assert!(BasaltError::ParsingError(String::new()).is_user_error());
        assert!(!BasaltError::InternalError(String::new()).is_user_error());
        assert!(!BasaltError::CodegenError(String::new()).is_user_error());
    }
}
