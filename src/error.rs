use core::fmt;

use crate::context::{ErrorCode, ErrorKind};
use crate::ir::{Direction, Opcode};

/// Failure to turn a shape into a runnable routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    UnsupportedShape {
        type_name: &'static str,
        reason: &'static str,
    },
    /// Statically-known nesting goes deeper than the configured maximum depth.
    NestingTooDeep {
        type_name: &'static str,
        depth: usize,
    },
    ProgramTooLong {
        len: usize,
        max: usize,
    },
    /// An instruction's operand does not fit its opcode, or a jump leaves the program.
    MalformedProgram {
        pc: usize,
        reason: &'static str,
    },
    /// The opcode has no meaning for the program's direction.
    WrongDirection {
        pc: usize,
        op: Opcode,
        direction: Direction,
    },
    /// Two roles were assigned the same physical location.
    RoleConflict {
        first: &'static str,
        second: &'static str,
    },
    /// The same thread asked for a routine it is still compiling.
    RecursiveCompilation {
        type_name: &'static str,
    },
    Assembly(String),
    ExecutableMemory(String),
    UnsupportedTarget,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnsupportedShape { type_name, reason } => {
                write!(f, "cannot compile {type_name}: {reason}")
            }
            CompileError::NestingTooDeep { type_name, depth } => {
                write!(f, "{type_name} nests {depth} levels deep, past the configured maximum")
            }
            CompileError::ProgramTooLong { len, max } => {
                write!(f, "program has {len} instructions, limit is {max}")
            }
            CompileError::MalformedProgram { pc, reason } => {
                write!(f, "malformed instruction at {pc}: {reason}")
            }
            CompileError::WrongDirection { pc, op, direction } => {
                write!(f, "opcode {op:?} at {pc} is not valid when {direction}")
            }
            CompileError::RoleConflict { first, second } => {
                write!(f, "roles {first} and {second} share a location")
            }
            CompileError::RecursiveCompilation { type_name } => {
                write!(f, "{type_name} requested itself while compiling")
            }
            CompileError::Assembly(msg) => write!(f, "code emission failed: {msg}"),
            CompileError::ExecutableMemory(msg) => write!(f, "executable memory: {msg}"),
            CompileError::UnsupportedTarget => {
                write!(f, "no code generator for this target")
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// A decode failure, or the first mismatch of a decode that kept going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub code: ErrorCode,
    /// Byte offset in the input where the problem was detected.
    pub offset: usize,
    /// Target type, when the failure is tied to one.
    pub shape: Option<&'static str>,
    /// Nearest enclosing object field.
    pub field: Option<&'static str>,
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.code, self.offset)?;
        if let Some(shape) = self.shape {
            write!(f, " (into {shape}")?;
            if let Some(field) = self.field {
                write!(f, ", field {field:?}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    pub code: ErrorCode,
    pub shape: Option<&'static str>,
}

impl EncodeError {
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape {
            Some(shape) => write!(f, "{} (encoding {shape})", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Any failure surfaced by [`Engine`](crate::Engine) calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Compile(CompileError),
    Decode(DecodeError),
    Encode(EncodeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile(e) => write!(f, "compile error: {e}"),
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Compile(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Encode(e) => Some(e),
        }
    }
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compile(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::Encode(e)
    }
}

/// Result of a decode that tolerates type mismatches.
#[derive(Debug)]
pub struct Decoded<T> {
    pub value: T,
    /// First value that did not fit its target and was skipped.
    pub mismatch: Option<DecodeError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display_names_field() {
        let err = DecodeError {
            code: ErrorCode::TypeMismatch,
            offset: 6,
            shape: Some("i64"),
            field: Some("a"),
        };
        assert_eq!(
            err.to_string(),
            "value does not match target type at offset 6 (into i64, field \"a\")"
        );
        assert_eq!(err.kind(), ErrorKind::Mismatch);
    }

    #[test]
    fn top_level_error_wraps_source() {
        use std::error::Error as _;
        let err: Error = CompileError::UnsupportedTarget.into();
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "compile error: no code generator for this target");
    }
}
