//! Runtime support called from generated code.
//!
//! Every function here has a fixed C signature. Failures are reported by
//! writing the context's error slot; generated code tests it after each call
//! and leaves through its error exit. Functions that take no context never
//! fail.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use facet::{Def, PtrConst, PtrMut, PtrUninit};

use crate::config::Options;
use crate::context::{DecodeContext, EncodeContext, ErrorCode};
use crate::ir::{Direction, FieldTable};
use crate::scan::{self, IntRead, ScanError};
use crate::shape::{self, FloatKind, IntKind, Shape, ShapeKind};
use crate::stack::RecursionStack;
use crate::value::{AnyValue, Bytes, Number, Value};

/// Live iteration over one map's entries, innermost last in `EncodeContext::iters`.
pub struct MapIter {
    entries: Vec<(*const String, *const u8)>,
    pos: usize,
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

/// Make room for `n` more output bytes.
pub unsafe extern "C" fn jitson_buf_grow(ctx: *mut EncodeContext<'_>, n: u64) {
    let ctx = unsafe { &mut *ctx };
    ctx.reserve(n as usize);
}

macro_rules! int_writers {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub unsafe extern "C" fn $name(ctx: *mut EncodeContext<'_>, src: *const u8) {
                let ctx = unsafe { &mut *ctx };
                let v = unsafe { (src as *const $ty).read_unaligned() };
                ctx.push_bytes(itoa::Buffer::new().format(v).as_bytes());
            }
        )*
    };
}

int_writers! {
    jitson_write_i8: i8,
    jitson_write_i16: i16,
    jitson_write_i32: i32,
    jitson_write_i64: i64,
    jitson_write_u8: u8,
    jitson_write_u16: u16,
    jitson_write_u32: u32,
    jitson_write_u64: u64,
}

pub fn int_writer(kind: IntKind) -> *const u8 {
    match kind {
        IntKind::I8 => jitson_write_i8 as *const u8,
        IntKind::I16 => jitson_write_i16 as *const u8,
        IntKind::I32 => jitson_write_i32 as *const u8,
        IntKind::I64 => jitson_write_i64 as *const u8,
        IntKind::U8 => jitson_write_u8 as *const u8,
        IntKind::U16 => jitson_write_u16 as *const u8,
        IntKind::U32 => jitson_write_u32 as *const u8,
        IntKind::U64 => jitson_write_u64 as *const u8,
    }
}

/// Shortest round-trip text, with `.0` added to integral values so they
/// read back as floats.
fn push_float_text(ctx: &mut EncodeContext<'_>, text: &str) {
    if !ctx.push_bytes(text.as_bytes()) {
        return;
    }
    if !text.bytes().any(|b| matches!(b, b'.' | b'e' | b'E')) {
        ctx.push_bytes(b".0");
    }
}

pub unsafe extern "C" fn jitson_write_f32(ctx: *mut EncodeContext<'_>, src: *const u8) {
    let ctx = unsafe { &mut *ctx };
    let v = unsafe { (src as *const f32).read_unaligned() };
    if !v.is_finite() {
        ctx.error_shape = Some("f32");
        ctx.fail(ErrorCode::NonFiniteFloat);
        return;
    }
    push_float_text(ctx, zmij::Buffer::new().format(v));
}

pub unsafe extern "C" fn jitson_write_f64(ctx: *mut EncodeContext<'_>, src: *const u8) {
    let ctx = unsafe { &mut *ctx };
    let v = unsafe { (src as *const f64).read_unaligned() };
    if !v.is_finite() {
        ctx.error_shape = Some("f64");
        ctx.fail(ErrorCode::NonFiniteFloat);
        return;
    }
    push_float_text(ctx, zmij::Buffer::new().format(v));
}

pub fn float_writer(kind: FloatKind) -> *const u8 {
    match kind {
        FloatKind::F32 => jitson_write_f32 as *const u8,
        FloatKind::F64 => jitson_write_f64 as *const u8,
    }
}

fn needs_escape(bytes: &[u8], html: bool) -> bool {
    bytes
        .iter()
        .any(|&b| b < 0x20 || b == b'"' || b == b'\\' || b == 0xE2 || (html && matches!(b, b'<' | b'>' | b'&')))
}

fn push_str(ctx: &mut EncodeContext<'_>, s: &str) {
    let html = ctx.options().contains(Options::ESCAPE_HTML);
    if !needs_escape(s.as_bytes(), html) {
        if ctx.reserve(s.len() + 2) {
            ctx.push_byte(b'"');
            ctx.push_bytes(s.as_bytes());
            ctx.push_byte(b'"');
        }
        return;
    }
    let mut escaped = Vec::with_capacity(s.len() + 16);
    scan::escape_str(&mut escaped, s, html);
    ctx.push_bytes(&escaped);
}

pub unsafe extern "C" fn jitson_write_str(ctx: *mut EncodeContext<'_>, src: *const String) {
    let ctx = unsafe { &mut *ctx };
    let s = unsafe { &*src };
    push_str(ctx, s);
}

pub unsafe extern "C" fn jitson_write_bytes(ctx: *mut EncodeContext<'_>, src: *const Bytes) {
    let ctx = unsafe { &mut *ctx };
    let bytes = unsafe { &*src };
    let encoded = BASE64.encode(&bytes.0);
    if ctx.reserve(encoded.len() + 2) {
        ctx.push_byte(b'"');
        ctx.push_bytes(encoded.as_bytes());
        ctx.push_byte(b'"');
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value, depth: usize, html: bool) -> Result<(), ErrorCode> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(Number::Int(v)) => out.extend_from_slice(itoa::Buffer::new().format(*v).as_bytes()),
        Value::Number(Number::Uint(v)) => out.extend_from_slice(itoa::Buffer::new().format(*v).as_bytes()),
        Value::Number(Number::Float(v)) => {
            if !v.is_finite() {
                return Err(ErrorCode::NonFiniteFloat);
            }
            let mut buf = zmij::Buffer::new();
            let text = buf.format(*v);
            out.extend_from_slice(text.as_bytes());
            if !text.bytes().any(|b| matches!(b, b'.' | b'e' | b'E')) {
                out.extend_from_slice(b".0");
            }
        }
        Value::String(s) => scan::escape_str(out, s, html),
        Value::Array(items) => {
            if depth == 0 {
                return Err(ErrorCode::DepthLimit);
            }
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item, depth - 1, html)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            if depth == 0 {
                return Err(ErrorCode::DepthLimit);
            }
            out.push(b'{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                scan::escape_str(out, key, html);
                out.push(b':');
                write_value(out, item, depth - 1, html)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

pub unsafe extern "C" fn jitson_write_value(ctx: *mut EncodeContext<'_>, src: *const Value) {
    let ctx = unsafe { &mut *ctx };
    let value = unsafe { &*src };
    let depth = ctx.engine().config().max_depth.saturating_sub(ctx.depth);
    let mut out = Vec::new();
    match write_value(&mut out, value, depth, ctx.options().contains(Options::ESCAPE_HTML)) {
        Ok(()) => {
            ctx.push_bytes(&out);
        }
        Err(code) => {
            ctx.error_shape = Some("Value");
            ctx.fail(code);
        }
    }
}

/// Run the encode routine for `shape` on `src`, sharing this call's context
/// and recursion stack.
fn reenter_encode(ctx: &mut EncodeContext<'_>, src: *const u8, shape: &'static Shape, stack: *mut RecursionStack) {
    let engine = ctx.engine();
    if ctx.depth >= engine.config().max_depth {
        ctx.error_shape = Some(shape.type_identifier);
        ctx.fail(ErrorCode::DepthLimit);
        return;
    }
    let routine = match engine.routine(shape, Direction::Encode) {
        Ok(routine) => routine,
        Err(e) => {
            tracing::debug!(shape = shape.type_identifier, error = %e, "nested encode routine unavailable");
            ctx.error_shape = Some(shape.type_identifier);
            ctx.fail(ErrorCode::CompileFailed);
            return;
        }
    };
    ctx.depth += 1;
    unsafe { routine.run_encode(ctx, src, stack) };
    ctx.depth -= 1;
}

pub unsafe extern "C" fn jitson_encode_recurse(
    ctx: *mut EncodeContext<'_>,
    src: *const u8,
    shape: *const Shape,
    stack: *mut RecursionStack,
) {
    let ctx = unsafe { &mut *ctx };
    let shape: &'static Shape = unsafe { &*shape };
    reenter_encode(ctx, src, shape, stack);
}

pub unsafe extern "C" fn jitson_encode_any(ctx: *mut EncodeContext<'_>, src: *const AnyValue, stack: *mut RecursionStack) {
    let ctx = unsafe { &mut *ctx };
    let any = unsafe { &*src };
    match any.raw() {
        Some((data, shape)) => reenter_encode(ctx, data, shape, stack),
        None => {
            ctx.push_bytes(b"null");
        }
    }
}

/// `out = [element pointer, length]` for the sequence at `src`.
pub unsafe extern "C" fn jitson_seq_view(src: *const u8, shape: *const Shape, out: *mut [usize; 2]) {
    let shape = unsafe { &*shape };
    let view = match &shape.def {
        Def::List(def) => {
            let list = PtrConst::new_sized(src);
            let data = def
                .vtable
                .as_ptr
                .map_or(core::ptr::null(), |as_ptr| unsafe { as_ptr(list) }.as_byte_ptr());
            [data as usize, unsafe { (def.vtable.len)(list) }]
        }
        _ => [0, 0],
    };
    unsafe { out.write(view) };
}

/// Inner value of the option at `src`, or null.
pub unsafe extern "C" fn jitson_opt_get(src: *const u8, shape: *const Shape) -> *const u8 {
    let shape = unsafe { &*shape };
    match &shape.def {
        Def::Option(def) => unsafe { (def.vtable.get_value)(PtrConst::new_sized(src)) }
            .map_or(core::ptr::null(), |inner| inner.as_byte_ptr()),
        _ => core::ptr::null(),
    }
}

/// 1 when the value at `src` is empty for `OMIT_EMPTY` purposes.
pub unsafe extern "C" fn jitson_is_empty(src: *const u8, shape: *const Shape) -> u64 {
    let shape: &'static Shape = unsafe { &*shape };
    let Ok(kind) = ShapeKind::of(shape) else {
        return 0;
    };
    let ptr = PtrConst::new_sized(src);
    let empty = unsafe {
        match kind {
            ShapeKind::Unit => true,
            ShapeKind::Bool => *src == 0,
            ShapeKind::Int(kind) => core::slice::from_raw_parts(src, kind.size()).iter().all(|&b| b == 0),
            ShapeKind::Float(FloatKind::F32) => (src as *const f32).read_unaligned() == 0.0,
            ShapeKind::Float(FloatKind::F64) => (src as *const f64).read_unaligned() == 0.0,
            ShapeKind::String => (&*(src as *const String)).is_empty(),
            ShapeKind::Bytes => (*(src as *const Bytes)).is_empty(),
            ShapeKind::Seq(def) => (def.vtable.len)(ptr) == 0,
            ShapeKind::Map(def) => (def.vtable.len)(ptr) == 0,
            ShapeKind::Option(def) => !(def.vtable.is_some)(ptr),
            ShapeKind::Dynamic => (*(src as *const Value)).is_null(),
            ShapeKind::Any => (*(src as *const AnyValue)).is_empty(),
            ShapeKind::Array(def) => def.n == 0,
            ShapeKind::Struct(_) | ShapeKind::Pointer(_) => false,
        }
    };
    u64::from(empty)
}

/// Start iterating the map at `src`. Returns the iterator's index.
pub unsafe extern "C" fn jitson_map_iter_begin(ctx: *mut EncodeContext<'_>, src: *const u8, shape: *const Shape) -> usize {
    let ctx = unsafe { &mut *ctx };
    let shape = unsafe { &*shape };
    let mut entries = Vec::new();
    if let Def::Map(def) = &shape.def {
        let map = PtrConst::new_sized(src);
        let iter_vtable = &def.vtable.iter_vtable;
        entries.reserve(unsafe { (def.vtable.len)(map) });
        if let Some(init) = iter_vtable.init_with_value {
            let iter = unsafe { init(map) };
            while let Some((key, value)) = unsafe { (iter_vtable.next)(iter) } {
                entries.push((key.as_byte_ptr() as *const String, value.as_byte_ptr()));
            }
            unsafe { (iter_vtable.dealloc)(iter) };
        }
    }
    if ctx.options().contains(Options::SORT_MAP_KEYS) {
        entries.sort_unstable_by(|a, b| unsafe { (*a.0).cmp(&*b.0) });
    }
    ctx.iters.push(MapIter { entries, pos: 0 });
    ctx.iters.len() - 1
}

/// Advance iterator `index`. Returns the next key, or null when exhausted.
pub unsafe extern "C" fn jitson_map_iter_next(ctx: *mut EncodeContext<'_>, index: usize) -> *const String {
    let ctx = unsafe { &mut *ctx };
    let Some(iter) = ctx.iters.get_mut(index) else {
        return core::ptr::null();
    };
    match iter.entries.get(iter.pos) {
        Some(&(key, _)) => {
            iter.pos += 1;
            key
        }
        None => core::ptr::null(),
    }
}

/// Value of the entry whose key `jitson_map_iter_next` returned last.
pub unsafe extern "C" fn jitson_map_iter_value(ctx: *mut EncodeContext<'_>, index: usize) -> *const u8 {
    let ctx = unsafe { &mut *ctx };
    ctx.iters
        .get(index)
        .and_then(|iter| iter.pos.checked_sub(1).and_then(|i| iter.entries.get(i)))
        .map_or(core::ptr::null(), |&(_, value)| value)
}

pub unsafe extern "C" fn jitson_map_iter_end(ctx: *mut EncodeContext<'_>) {
    let ctx = unsafe { &mut *ctx };
    ctx.iters.pop();
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

fn fail_scan(ctx: &mut DecodeContext<'_>, e: ScanError) {
    let at = ctx.offset() + e.at;
    ctx.fail_at(e.code, at);
}

fn skip_ws(ctx: &mut DecodeContext<'_>) {
    let n = scan::skip_ws(ctx.rest());
    ctx.advance(n);
}

/// Skip whitespace, then consume a `null` literal if one is next.
fn take_null(ctx: &mut DecodeContext<'_>) -> bool {
    skip_ws(ctx);
    if ctx.rest().starts_with(b"null") {
        ctx.advance(4);
        return true;
    }
    false
}

fn skip_one(ctx: &mut DecodeContext<'_>) {
    let max_depth = ctx.engine().config().max_depth.saturating_sub(ctx.depth);
    match scan::skip_value(ctx.rest(), max_depth) {
        Ok(n) => ctx.advance(n),
        Err(e) => fail_scan(ctx, e),
    }
}

/// The value at the cursor does not fit `shape`: record it and move past it.
fn skip_mismatched(ctx: &mut DecodeContext<'_>, code: ErrorCode, shape: &'static str) {
    let at = ctx.offset();
    ctx.mismatch(code, shape, at);
    if !ctx.has_error() {
        skip_one(ctx);
    }
}

/// Called on the byte that should have opened a container of `shape`.
pub unsafe extern "C" fn jitson_mismatch_skip(ctx: *mut DecodeContext<'_>, shape: *const Shape) {
    let ctx = unsafe { &mut *ctx };
    let shape = unsafe { &*shape };
    skip_mismatched(ctx, ErrorCode::TypeMismatch, shape.type_identifier);
}

pub unsafe extern "C" fn jitson_expect_failed(ctx: *mut DecodeContext<'_>, _byte: u64) {
    let ctx = unsafe { &mut *ctx };
    let e = scan::unexpected(ctx.rest(), 0);
    fail_scan(ctx, e);
}

pub unsafe extern "C" fn jitson_skip_value(ctx: *mut DecodeContext<'_>) {
    let ctx = unsafe { &mut *ctx };
    skip_one(ctx);
}

pub unsafe extern "C" fn jitson_read_bool(ctx: *mut DecodeContext<'_>, dst: *mut u8) {
    let ctx = unsafe { &mut *ctx };
    if take_null(ctx) {
        return;
    }
    let rest = ctx.rest();
    let (word, v): (&[u8], bool) = match rest.first() {
        Some(b't') => (b"true", true),
        Some(b'f') => (b"false", false),
        _ => return skip_mismatched(ctx, ErrorCode::TypeMismatch, "bool"),
    };
    match scan::literal(rest, word) {
        Ok(n) => {
            ctx.advance(n);
            unsafe { *dst = u8::from(v) };
        }
        Err(e) => fail_scan(ctx, e),
    }
}

fn int_range(kind: IntKind) -> (i128, i128) {
    let (lo, hi) = kind.bounds();
    if kind.signed() {
        (lo as i128, hi as i128)
    } else {
        (0, hi as u64 as i128)
    }
}

/// Parse an integer for `kind` at the cursor. `None` means nothing is to be
/// stored: a `null`, a recorded mismatch, or a fatal error.
fn read_int(ctx: &mut DecodeContext<'_>, kind: IntKind) -> Option<i128> {
    if take_null(ctx) {
        return None;
    }
    let rest = ctx.rest();
    if !matches!(rest.first(), Some(b'-' | b'0'..=b'9')) {
        skip_mismatched(ctx, ErrorCode::TypeMismatch, kind.name());
        return None;
    }
    let info = match scan::number(rest) {
        Ok(info) => info,
        Err(e) => {
            fail_scan(ctx, e);
            return None;
        }
    };
    let lexeme = &rest[..info.len];
    let read = if info.negative {
        match scan::parse_i64(lexeme, info) {
            IntRead::Value(v) => IntRead::Value(v as i128),
            IntRead::OutOfRange => IntRead::OutOfRange,
            IntRead::NotInteger => IntRead::NotInteger,
        }
    } else {
        match scan::parse_u64(lexeme, info) {
            IntRead::Value(v) => IntRead::Value(v as i128),
            IntRead::OutOfRange => IntRead::OutOfRange,
            IntRead::NotInteger => IntRead::NotInteger,
        }
    };
    let (lo, hi) = int_range(kind);
    match read {
        IntRead::Value(v) if (lo..=hi).contains(&v) => {
            ctx.advance(info.len);
            Some(v)
        }
        IntRead::Value(_) | IntRead::OutOfRange => {
            skip_mismatched(ctx, ErrorCode::NumberOutOfRange, kind.name());
            None
        }
        IntRead::NotInteger => {
            skip_mismatched(ctx, ErrorCode::TypeMismatch, kind.name());
            None
        }
    }
}

macro_rules! int_readers {
    ($($name:ident: $ty:ty => $kind:expr),* $(,)?) => {
        $(
            pub unsafe extern "C" fn $name(ctx: *mut DecodeContext<'_>, dst: *mut u8) {
                let ctx = unsafe { &mut *ctx };
                if let Some(v) = read_int(ctx, $kind) {
                    unsafe { (dst as *mut $ty).write_unaligned(v as $ty) };
                }
            }
        )*
    };
}

int_readers! {
    jitson_read_i8: i8 => IntKind::I8,
    jitson_read_i16: i16 => IntKind::I16,
    jitson_read_i32: i32 => IntKind::I32,
    jitson_read_i64: i64 => IntKind::I64,
    jitson_read_u8: u8 => IntKind::U8,
    jitson_read_u16: u16 => IntKind::U16,
    jitson_read_u32: u32 => IntKind::U32,
    jitson_read_u64: u64 => IntKind::U64,
}

pub fn int_reader(kind: IntKind) -> *const u8 {
    match kind {
        IntKind::I8 => jitson_read_i8 as *const u8,
        IntKind::I16 => jitson_read_i16 as *const u8,
        IntKind::I32 => jitson_read_i32 as *const u8,
        IntKind::I64 => jitson_read_i64 as *const u8,
        IntKind::U8 => jitson_read_u8 as *const u8,
        IntKind::U16 => jitson_read_u16 as *const u8,
        IntKind::U32 => jitson_read_u32 as *const u8,
        IntKind::U64 => jitson_read_u64 as *const u8,
    }
}

fn read_float(ctx: &mut DecodeContext<'_>, kind: FloatKind) -> Option<f64> {
    if take_null(ctx) {
        return None;
    }
    let rest = ctx.rest();
    if !matches!(rest.first(), Some(b'-' | b'0'..=b'9')) {
        skip_mismatched(ctx, ErrorCode::TypeMismatch, kind.name());
        return None;
    }
    let info = match scan::number(rest) {
        Ok(info) => info,
        Err(e) => {
            fail_scan(ctx, e);
            return None;
        }
    };
    let v = scan::parse_f64(&rest[..info.len])
        .filter(|v| kind == FloatKind::F64 || v.abs() <= f32::MAX as f64);
    match v {
        Some(v) => {
            ctx.advance(info.len);
            Some(v)
        }
        None => {
            skip_mismatched(ctx, ErrorCode::NumberOutOfRange, kind.name());
            None
        }
    }
}

pub unsafe extern "C" fn jitson_read_f32(ctx: *mut DecodeContext<'_>, dst: *mut u8) {
    let ctx = unsafe { &mut *ctx };
    if let Some(v) = read_float(ctx, FloatKind::F32) {
        unsafe { (dst as *mut f32).write_unaligned(v as f32) };
    }
}

pub unsafe extern "C" fn jitson_read_f64(ctx: *mut DecodeContext<'_>, dst: *mut u8) {
    let ctx = unsafe { &mut *ctx };
    if let Some(v) = read_float(ctx, FloatKind::F64) {
        unsafe { (dst as *mut f64).write_unaligned(v) };
    }
}

pub fn float_reader(kind: FloatKind) -> *const u8 {
    match kind {
        FloatKind::F32 => jitson_read_f32 as *const u8,
        FloatKind::F64 => jitson_read_f64 as *const u8,
    }
}

/// Decode the string literal at the cursor into `out` (replacing its
/// contents). False when there was no string or the input was malformed.
fn read_string_into(ctx: &mut DecodeContext<'_>, out: &mut Vec<u8>, shape: &'static str) -> bool {
    let rest = ctx.rest();
    if rest.first() != Some(&b'"') {
        skip_mismatched(ctx, ErrorCode::TypeMismatch, shape);
        return false;
    }
    out.clear();
    let validate = ctx.options().contains(Options::VALIDATE_STRING);
    match scan::string(rest, out, validate) {
        Ok(n) => {
            ctx.advance(n);
            true
        }
        Err(e) => {
            out.clear();
            fail_scan(ctx, e);
            false
        }
    }
}

pub unsafe extern "C" fn jitson_read_string(ctx: *mut DecodeContext<'_>, dst: *mut String) {
    let ctx = unsafe { &mut *ctx };
    if take_null(ctx) {
        return;
    }
    // SAFETY: `read_string_into` leaves either the old contents, valid
    // decoded text, or nothing.
    let buf = unsafe { (*dst).as_mut_vec() };
    read_string_into(ctx, buf, "String");
}

pub unsafe extern "C" fn jitson_read_bytes(ctx: *mut DecodeContext<'_>, dst: *mut Bytes) {
    let ctx = unsafe { &mut *ctx };
    if take_null(ctx) {
        return;
    }
    let start = ctx.offset();
    let mut text = core::mem::take(&mut ctx.scratch);
    if read_string_into(ctx, &mut text, "Bytes") {
        match BASE64.decode(&text) {
            Ok(bytes) => unsafe { (*dst).0 = bytes },
            Err(_) => {
                ctx.error_shape = Some("Bytes");
                ctx.fail_at(ErrorCode::InvalidBase64, start);
            }
        }
    }
    ctx.scratch = text;
}

fn number_value(lexeme: &[u8], info: scan::NumberLexeme) -> Option<Number> {
    if !info.is_float {
        if info.negative {
            if let IntRead::Value(v) = scan::parse_i64(lexeme, info) {
                return Some(Number::Int(v));
            }
        } else if let IntRead::Value(v) = scan::parse_u64(lexeme, info) {
            return Some(i64::try_from(v).map_or(Number::Uint(v), Number::Int));
        }
    }
    scan::parse_f64(lexeme).map(Number::Float)
}

/// Parse one JSON value starting at `*pos`, nesting at most `depth` containers.
fn parse_value(input: &[u8], pos: &mut usize, depth: usize, validate: bool) -> Result<Value, ScanError> {
    *pos += scan::skip_ws(&input[*pos..]);
    let at = *pos;
    let rest = &input[at..];
    let shifted = |e: ScanError| ScanError {
        code: e.code,
        at: e.at + at,
    };
    match rest.first() {
        None => Err(scan::unexpected(input, at)),
        Some(b'n') => {
            *pos += scan::literal(rest, b"null").map_err(shifted)?;
            Ok(Value::Null)
        }
        Some(b't') => {
            *pos += scan::literal(rest, b"true").map_err(shifted)?;
            Ok(Value::Bool(true))
        }
        Some(b'f') => {
            *pos += scan::literal(rest, b"false").map_err(shifted)?;
            Ok(Value::Bool(false))
        }
        Some(b'"') => Ok(Value::String(parse_key(input, pos, validate)?)),
        Some(b'-' | b'0'..=b'9') => {
            let info = scan::number(rest).map_err(shifted)?;
            let n = number_value(&rest[..info.len], info).ok_or(ScanError {
                code: ErrorCode::NumberOutOfRange,
                at,
            })?;
            *pos += info.len;
            Ok(Value::Number(n))
        }
        Some(&open @ (b'[' | b'{')) => {
            if depth == 0 {
                return Err(ScanError {
                    code: ErrorCode::DepthLimit,
                    at,
                });
            }
            let close = if open == b'[' { b']' } else { b'}' };
            *pos += 1;
            *pos += scan::skip_ws(&input[*pos..]);
            let mut items = Vec::new();
            let mut fields = std::collections::BTreeMap::new();
            if input.get(*pos) == Some(&close) {
                *pos += 1;
            } else {
                loop {
                    if open == b'[' {
                        items.push(parse_value(input, pos, depth - 1, validate)?);
                    } else {
                        *pos += scan::skip_ws(&input[*pos..]);
                        let key = parse_key(input, pos, validate)?;
                        *pos += scan::skip_ws(&input[*pos..]);
                        if input.get(*pos) != Some(&b':') {
                            return Err(scan::unexpected(input, *pos));
                        }
                        *pos += 1;
                        fields.insert(key, parse_value(input, pos, depth - 1, validate)?);
                    }
                    *pos += scan::skip_ws(&input[*pos..]);
                    match input.get(*pos) {
                        Some(b',') => *pos += 1,
                        Some(&b) if b == close => {
                            *pos += 1;
                            break;
                        }
                        _ => return Err(scan::unexpected(input, *pos)),
                    }
                }
            }
            Ok(if open == b'[' {
                Value::Array(items)
            } else {
                Value::Object(fields)
            })
        }
        Some(_) => Err(ScanError {
            code: ErrorCode::UnexpectedChar,
            at,
        }),
    }
}

/// A string literal at `*pos`, which must be `"`.
fn parse_key(input: &[u8], pos: &mut usize, validate: bool) -> Result<String, ScanError> {
    let at = *pos;
    let mut out = Vec::new();
    let n = scan::string(&input[at..], &mut out, validate).map_err(|e| ScanError {
        code: e.code,
        at: e.at + at,
    })?;
    *pos += n;
    String::from_utf8(out).map_err(|_| ScanError {
        code: ErrorCode::InvalidUtf8,
        at,
    })
}

fn read_value(ctx: &mut DecodeContext<'_>) -> Option<Value> {
    let depth = ctx.engine().config().max_depth.saturating_sub(ctx.depth);
    let validate = ctx.options().contains(Options::VALIDATE_STRING);
    let input = ctx.rest();
    let mut pos = 0;
    match parse_value(input, &mut pos, depth, validate) {
        Ok(v) => {
            ctx.advance(pos);
            Some(v)
        }
        Err(e) => {
            fail_scan(ctx, e);
            None
        }
    }
}

pub unsafe extern "C" fn jitson_read_value(ctx: *mut DecodeContext<'_>, dst: *mut Value) {
    let ctx = unsafe { &mut *ctx };
    if let Some(v) = read_value(ctx) {
        unsafe { *dst = v };
    }
}

fn reenter_decode(ctx: &mut DecodeContext<'_>, dst: *mut u8, shape: &'static Shape, stack: *mut RecursionStack) {
    let engine = ctx.engine();
    if ctx.depth >= engine.config().max_depth {
        ctx.error_shape = Some(shape.type_identifier);
        ctx.fail(ErrorCode::DepthLimit);
        return;
    }
    let routine = match engine.routine(shape, Direction::Decode) {
        Ok(routine) => routine,
        Err(e) => {
            tracing::debug!(shape = shape.type_identifier, error = %e, "nested decode routine unavailable");
            ctx.error_shape = Some(shape.type_identifier);
            ctx.fail(ErrorCode::CompileFailed);
            return;
        }
    };
    ctx.depth += 1;
    unsafe { routine.run_decode(ctx, dst, stack) };
    ctx.depth -= 1;
}

pub unsafe extern "C" fn jitson_decode_recurse(
    ctx: *mut DecodeContext<'_>,
    dst: *mut u8,
    shape: *const Shape,
    stack: *mut RecursionStack,
) {
    let ctx = unsafe { &mut *ctx };
    let shape: &'static Shape = unsafe { &*shape };
    reenter_decode(ctx, dst, shape, stack);
}

pub unsafe extern "C" fn jitson_decode_any(ctx: *mut DecodeContext<'_>, dst: *mut AnyValue, stack: *mut RecursionStack) {
    let ctx = unsafe { &mut *ctx };
    let any = unsafe { &mut *dst };
    match any.raw_mut() {
        Some((data, shape)) => reenter_decode(ctx, data, shape, stack),
        None => {
            if let Some(v) = read_value(ctx) {
                *any = AnyValue::new(v);
            }
        }
    }
}

/// Read `"key"` and the `:` after it into `out`.
fn read_key(ctx: &mut DecodeContext<'_>, out: &mut Vec<u8>) -> bool {
    skip_ws(ctx);
    let rest = ctx.rest();
    if rest.first() != Some(&b'"') {
        fail_scan(ctx, scan::unexpected(rest, 0));
        return false;
    }
    out.clear();
    let validate = ctx.options().contains(Options::VALIDATE_STRING);
    match scan::string(rest, out, validate) {
        Ok(n) => ctx.advance(n),
        Err(e) => {
            fail_scan(ctx, e);
            return false;
        }
    }
    skip_ws(ctx);
    let rest = ctx.rest();
    if rest.first() != Some(&b':') {
        fail_scan(ctx, scan::unexpected(rest, 0));
        return false;
    }
    ctx.advance(1);
    true
}

/// Read an object key and its `:`. Returns the field's index in `table`, or -1.
pub unsafe extern "C" fn jitson_lookup_field(ctx: *mut DecodeContext<'_>, table: *const FieldTable) -> i64 {
    let ctx = unsafe { &mut *ctx };
    let table = unsafe { &*table };
    let mut key = core::mem::take(&mut ctx.scratch);
    let found = if read_key(ctx, &mut key) {
        table.lookup(&key, ctx.options().contains(Options::CASE_SENSITIVE))
    } else {
        None
    };
    ctx.scratch = key;
    match found {
        Some(i) => {
            ctx.field = table.name(i);
            i as i64
        }
        None => {
            ctx.field = None;
            -1
        }
    }
}

pub unsafe extern "C" fn jitson_unknown_field(ctx: *mut DecodeContext<'_>) {
    let ctx = unsafe { &mut *ctx };
    if ctx.options().contains(Options::DISALLOW_UNKNOWN_FIELDS) {
        skip_ws(ctx);
        ctx.fail(ErrorCode::UnknownField);
        return;
    }
    skip_one(ctx);
}

/// Build a default `shape` in a temporary and hand it to `consume`, which
/// must move it out. False when no default could be built.
unsafe fn with_default(shape: &'static Shape, consume: impl FnOnce(PtrMut)) -> bool {
    let Ok(tmp) = shape.allocate() else {
        return false;
    };
    let value = unsafe { tmp.assume_init() };
    let built = unsafe { shape.call_default_in_place(value) }.is_some();
    if built {
        consume(value);
    }
    let _ = unsafe { shape.deallocate_uninit(tmp) };
    built
}

/// Make the option at `dst` `Some`, keeping an existing value, and return
/// the inner pointer.
pub unsafe extern "C" fn jitson_opt_init(dst: *mut u8, shape: *const Shape) -> *mut u8 {
    let shape = unsafe { &*shape };
    let Def::Option(def) = &shape.def else {
        return dst;
    };
    let opt = PtrMut::new_sized(dst);
    if unsafe { !(def.vtable.is_some)(opt.as_const()) } {
        unsafe { with_default(def.t, |value| (def.vtable.replace_with)(opt, Some(value.as_const()))) };
    }
    unsafe { (def.vtable.get_value)(opt.as_const()) }.map_or(core::ptr::null_mut(), |inner| inner.as_byte_ptr() as *mut u8)
}

pub unsafe extern "C" fn jitson_opt_clear(dst: *mut u8, shape: *const Shape) {
    let shape = unsafe { &*shape };
    if let Def::Option(def) = &shape.def {
        unsafe { (def.vtable.replace_with)(PtrMut::new_sized(dst), None) };
    }
}

pub unsafe extern "C" fn jitson_seq_clear(dst: *mut u8, shape: *const Shape) {
    let shape: &'static Shape = unsafe { &*shape };
    if let Def::List(def) = &shape.def
        && let Some(init) = def.init_in_place_with_capacity()
    {
        unsafe {
            shape.call_drop_in_place(PtrMut::new_sized(dst));
            init(PtrUninit::new_sized(dst), 0);
        }
    }
}

/// Append a default element and return a pointer to it.
pub unsafe extern "C" fn jitson_seq_push(dst: *mut u8, shape: *const Shape) -> *mut u8 {
    let shape = unsafe { &*shape };
    let Def::List(def) = &shape.def else {
        return dst;
    };
    let (Some(push), Some(as_mut_ptr), Some(stride)) = (def.push(), def.vtable.as_mut_ptr, shape::stride(def.t)) else {
        return core::ptr::null_mut();
    };
    let list = PtrMut::new_sized(dst);
    unsafe { with_default(def.t, |item| push(list, item)) };
    let len = unsafe { (def.vtable.len)(list.as_const()) };
    let base = unsafe { as_mut_ptr(list) }.as_mut_byte_ptr();
    unsafe { base.add(len.saturating_sub(1) * stride) }
}

pub unsafe extern "C" fn jitson_map_clear(dst: *mut u8, shape: *const Shape) {
    let shape: &'static Shape = unsafe { &*shape };
    if let Def::Map(def) = &shape.def {
        unsafe {
            shape.call_drop_in_place(PtrMut::new_sized(dst));
            (def.vtable.init_in_place_with_capacity)(PtrUninit::new_sized(dst), 0);
        }
    }
}

/// Read a key and its `:`, then insert a default value under it. A repeated
/// key starts over from the default.
pub unsafe extern "C" fn jitson_map_entry(ctx: *mut DecodeContext<'_>, dst: *mut u8, shape: *const Shape) -> *mut u8 {
    let ctx = unsafe { &mut *ctx };
    let shape = unsafe { &*shape };
    let Def::Map(def) = &shape.def else {
        return core::ptr::null_mut();
    };
    let mut key = Vec::new();
    if !read_key(ctx, &mut key) {
        return core::ptr::null_mut();
    }
    let Ok(key) = String::from_utf8(key) else {
        ctx.fail(ErrorCode::InvalidUtf8);
        return core::ptr::null_mut();
    };
    let lookup = key.clone();
    // `insert` moves the key out of this slot.
    let mut slot = core::mem::ManuallyDrop::new(key);
    let map = PtrMut::new_sized(dst);
    let key_ptr = PtrMut::new_sized(&mut *slot as *mut String);
    if !unsafe { with_default(def.v, |value| (def.vtable.insert)(map, key_ptr, value)) } {
        drop(core::mem::ManuallyDrop::into_inner(slot));
        ctx.error_shape = Some(def.v.type_identifier);
        ctx.fail(ErrorCode::CompileFailed);
        return core::ptr::null_mut();
    }
    unsafe { (def.vtable.get_value_ptr)(map.as_const(), PtrConst::new_sized(&lookup as *const String)) }
        .map_or(core::ptr::null_mut(), |value| value.as_byte_ptr() as *mut u8)
}
