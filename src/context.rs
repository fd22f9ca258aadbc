use core::fmt;

use crate::Engine;
use crate::config::Options;
use crate::error::{DecodeError, EncodeError};
use crate::intrinsics::MapIter;
use crate::pool::PooledBuf;

/// Error information written by runtime support when something goes wrong.
///
/// Generated code only ever tests `code`; the payload is interpreted by the
/// Rust side when the routine returns.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorSlot {
    /// Non-zero means an error occurred.
    pub code: u32,
    pub _pad: u32,
    /// Input offset for decoding, output length for encoding.
    pub payload: u64,
}

/// Broad classification of an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Mismatch,
    Resource,
    Unsupported,
}

/// Error codes written into `ErrorSlot.code`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,

    UnexpectedEof = 1,
    UnexpectedChar = 2,
    InvalidNumber = 3,
    InvalidEscape = 4,
    InvalidUtf8 = 5,
    InvalidLiteral = 6,
    TrailingCharacters = 7,
    ControlCharacter = 8,
    InvalidBase64 = 9,

    TypeMismatch = 32,
    NumberOutOfRange = 33,
    UnknownField = 34,

    StackOverflow = 64,
    DepthLimit = 65,
    BufferLimit = 66,

    NonFiniteFloat = 96,
    CompileFailed = 97,
}

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        match self as u32 {
            0..32 => ErrorKind::Syntax,
            32..64 => ErrorKind::Mismatch,
            64..96 => ErrorKind::Resource,
            _ => ErrorKind::Unsupported,
        }
    }

    /// Inverse of `code as u32`; unknown values map to `None`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        use ErrorCode::*;
        Some(match raw {
            0 => Ok,
            1 => UnexpectedEof,
            2 => UnexpectedChar,
            3 => InvalidNumber,
            4 => InvalidEscape,
            5 => InvalidUtf8,
            6 => InvalidLiteral,
            7 => TrailingCharacters,
            8 => ControlCharacter,
            9 => InvalidBase64,
            32 => TypeMismatch,
            33 => NumberOutOfRange,
            34 => UnknownField,
            64 => StackOverflow,
            65 => DepthLimit,
            66 => BufferLimit,
            96 => NonFiniteFloat,
            97 => CompileFailed,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Ok => write!(f, "no error"),
            ErrorCode::UnexpectedEof => write!(f, "unexpected end of input"),
            ErrorCode::UnexpectedChar => write!(f, "unexpected character"),
            ErrorCode::InvalidNumber => write!(f, "invalid number"),
            ErrorCode::InvalidEscape => write!(f, "invalid escape sequence"),
            ErrorCode::InvalidUtf8 => write!(f, "invalid UTF-8"),
            ErrorCode::InvalidLiteral => write!(f, "invalid literal"),
            ErrorCode::TrailingCharacters => write!(f, "trailing characters after value"),
            ErrorCode::ControlCharacter => write!(f, "control character in string"),
            ErrorCode::InvalidBase64 => write!(f, "invalid base64 data"),
            ErrorCode::TypeMismatch => write!(f, "value does not match target type"),
            ErrorCode::NumberOutOfRange => write!(f, "number out of range for target type"),
            ErrorCode::UnknownField => write!(f, "unknown field"),
            ErrorCode::StackOverflow => write!(f, "recursion stack exhausted"),
            ErrorCode::DepthLimit => write!(f, "nesting depth limit exceeded"),
            ErrorCode::BufferLimit => write!(f, "output buffer could not grow"),
            ErrorCode::NonFiniteFloat => write!(f, "non-finite float cannot be encoded"),
            ErrorCode::CompileFailed => write!(f, "nested routine failed to compile"),
        }
    }
}

/// Output buffer state for an encode call.
///
/// The first fields are read and written by generated code through the
/// `ENC_*` offsets below. Bytes are written into the pooled vector's spare
/// capacity; its length is only fixed up when the call finishes.
#[repr(C)]
pub struct EncodeContext<'a> {
    pub buf_ptr: *mut u8,
    pub buf_len: usize,
    pub buf_cap: usize,
    pub flags: u64,
    pub error: ErrorSlot,
    pub depth: usize,
    pub(crate) engine: &'a Engine,
    pub(crate) buf: PooledBuf,
    pub(crate) iters: Vec<MapIter>,
    pub(crate) error_shape: Option<&'static str>,
}

/// Input cursor state for a decode call.
#[repr(C)]
pub struct DecodeContext<'a> {
    pub input_ptr: *const u8,
    pub input_end: *const u8,
    pub input_start: *const u8,
    pub flags: u64,
    pub error: ErrorSlot,
    pub depth: usize,
    pub(crate) engine: &'a Engine,
    /// First recorded type mismatch.
    pub(crate) mismatch: Option<DecodeError>,
    /// Most recently matched field name.
    pub(crate) field: Option<&'static str>,
    pub(crate) error_shape: Option<&'static str>,
    /// Unescape buffer for object keys.
    pub(crate) scratch: Vec<u8>,
}

pub const ENC_BUF_PTR: u32 = core::mem::offset_of!(EncodeContext<'static>, buf_ptr) as u32;
pub const ENC_BUF_LEN: u32 = core::mem::offset_of!(EncodeContext<'static>, buf_len) as u32;
pub const ENC_BUF_CAP: u32 = core::mem::offset_of!(EncodeContext<'static>, buf_cap) as u32;

pub const DEC_INPUT_PTR: u32 = core::mem::offset_of!(DecodeContext<'static>, input_ptr) as u32;
pub const DEC_INPUT_END: u32 = core::mem::offset_of!(DecodeContext<'static>, input_end) as u32;
pub const DEC_INPUT_START: u32 = core::mem::offset_of!(DecodeContext<'static>, input_start) as u32;

// Shared by both directions.
pub const CTX_FLAGS: u32 = core::mem::offset_of!(EncodeContext<'static>, flags) as u32;
pub const CTX_ERROR_CODE: u32 = core::mem::offset_of!(EncodeContext<'static>, error.code) as u32;

const _: () = {
    assert!(
        core::mem::offset_of!(EncodeContext<'static>, flags)
            == core::mem::offset_of!(DecodeContext<'static>, flags)
    );
    assert!(
        core::mem::offset_of!(EncodeContext<'static>, error)
            == core::mem::offset_of!(DecodeContext<'static>, error)
    );
};

impl<'a> EncodeContext<'a> {
    pub(crate) fn new(engine: &'a Engine, options: Options) -> Result<Self, EncodeError> {
        let Some(mut buf) = engine.pool().checkout(engine.config().initial_buffer) else {
            return Err(EncodeError {
                code: ErrorCode::BufferLimit,
                shape: None,
            });
        };
        let buf_ptr = buf.as_mut_ptr();
        let buf_cap = buf.capacity();
        Ok(EncodeContext {
            buf_ptr,
            buf_len: 0,
            buf_cap,
            flags: options.bits(),
            error: ErrorSlot::default(),
            depth: 0,
            engine,
            buf,
            iters: Vec::new(),
            error_shape: None,
        })
    }

    pub fn options(&self) -> Options {
        Options::from_bits_truncate(self.flags)
    }

    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        // SAFETY: the first `buf_len` bytes of the buffer have been initialized.
        unsafe { core::slice::from_raw_parts(self.buf_ptr, self.buf_len) }
    }

    /// Make room for `additional` more bytes. On failure the error slot is set
    /// and `false` is returned.
    pub fn reserve(&mut self, additional: usize) -> bool {
        if self.buf_cap - self.buf_len >= additional {
            return true;
        }
        let needed = match self.buf_len.checked_add(additional) {
            Some(n) if n <= self.engine.config().max_buffer => n,
            _ => {
                self.fail(ErrorCode::BufferLimit);
                return false;
            }
        };
        let target = needed.max(self.buf_cap.saturating_mul(2)).min(self.engine.config().max_buffer);
        let Some(mut next) = self.engine.pool().checkout(target) else {
            self.fail(ErrorCode::BufferLimit);
            return false;
        };
        // SAFETY: both buffers hold at least `buf_len` bytes of capacity and do not overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.buf_ptr, next.as_mut_ptr(), self.buf_len);
        }
        tracing::trace!(from = self.buf_cap, to = next.capacity(), "grew output buffer");
        self.buf_ptr = next.as_mut_ptr();
        self.buf_cap = next.capacity();
        // The old buffer goes back to the pool when dropped.
        drop(core::mem::replace(&mut self.buf, next));
        true
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> bool {
        if !self.reserve(bytes.len()) {
            return false;
        }
        // SAFETY: `reserve` guaranteed room for `bytes.len()` more bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buf_ptr.add(self.buf_len), bytes.len());
        }
        self.buf_len += bytes.len();
        true
    }

    pub fn push_byte(&mut self, b: u8) -> bool {
        self.push_bytes(&[b])
    }

    /// Record an error. The first error wins.
    pub fn fail(&mut self, code: ErrorCode) {
        if self.error.code == 0 {
            self.error.code = code as u32;
            self.error.payload = self.buf_len as u64;
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.code != 0
    }

    pub(crate) fn take_error(&mut self) -> Option<EncodeError> {
        let code = ErrorCode::from_raw(self.error.code)?;
        if code == ErrorCode::Ok {
            return None;
        }
        Some(EncodeError {
            code,
            shape: self.error_shape,
        })
    }

    /// Give up the output. `buf_len` bytes are fixed up as the vector's length.
    pub(crate) fn into_buf(self) -> PooledBuf {
        let mut buf = self.buf;
        // SAFETY: generated code and runtime support initialized exactly `buf_len` bytes.
        unsafe { buf.set_len(self.buf_len) };
        buf
    }
}

impl<'a> DecodeContext<'a> {
    pub(crate) fn new(engine: &'a Engine, input: &[u8], options: Options) -> Self {
        let range = input.as_ptr_range();
        DecodeContext {
            input_ptr: range.start,
            input_end: range.end,
            input_start: range.start,
            flags: options.bits(),
            error: ErrorSlot::default(),
            depth: 0,
            engine,
            mismatch: None,
            field: None,
            error_shape: None,
            scratch: Vec::new(),
        }
    }

    pub fn options(&self) -> Options {
        Options::from_bits_truncate(self.flags)
    }

    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// The unread part of the input.
    pub fn rest(&self) -> &'a [u8] {
        // SAFETY: input_ptr..input_end always lies within the caller's input slice,
        // which outlives the context.
        unsafe {
            let len = self.input_end.offset_from(self.input_ptr) as usize;
            core::slice::from_raw_parts(self.input_ptr, len)
        }
    }

    pub fn offset(&self) -> usize {
        // SAFETY: both pointers come from the same input slice.
        unsafe { self.input_ptr.offset_from(self.input_start) as usize }
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.rest().len());
        // SAFETY: callers never advance past input_end.
        self.input_ptr = unsafe { self.input_ptr.add(n) };
    }

    /// Record a fatal error at the current offset. The first error wins.
    pub fn fail(&mut self, code: ErrorCode) {
        self.fail_at(code, self.offset());
    }

    pub fn fail_at(&mut self, code: ErrorCode, offset: usize) {
        if self.error.code == 0 {
            self.error.code = code as u32;
            self.error.payload = offset as u64;
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.code != 0
    }

    /// Record a type mismatch for a value of type `shape` starting at `offset`.
    ///
    /// Under `STOP_ON_MISMATCH` this becomes a fatal error; otherwise only the
    /// first mismatch is kept and the caller skips the value.
    pub fn mismatch(&mut self, code: ErrorCode, shape: &'static str, offset: usize) {
        if self.options().contains(Options::STOP_ON_MISMATCH) {
            self.error_shape = Some(shape);
            self.fail_at(code, offset);
            return;
        }
        if self.mismatch.is_none() {
            tracing::trace!(%code, shape, offset, "recorded first type mismatch");
            self.mismatch = Some(DecodeError {
                code,
                offset,
                shape: Some(shape),
                field: self.field,
            });
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<DecodeError> {
        let code = ErrorCode::from_raw(self.error.code)?;
        if code == ErrorCode::Ok {
            return None;
        }
        Some(DecodeError {
            code,
            offset: self.error.payload as usize,
            shape: self.error_shape,
            field: self.field,
        })
    }
}
