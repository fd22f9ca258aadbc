//! Linear intermediate representation consumed by the code generators.
//!
//! A [`Program`] is a flat list of [`Instr`]s for one shape and one
//! direction. Control flow is expressed with instruction indices: every
//! instruction index is a potential jump target.
//!
//! Register roles referenced by opcode descriptions:
//! - `P`: data pointer (the value being encoded or decoded)
//! - `C`: container cursor (next element, or a map iterator)
//! - `L`: remaining element count
//! - `E`: element size
//! - `R`: result of the last field lookup

use core::fmt;
use std::sync::Arc;

use crate::error::CompileError;
use crate::shape::{FloatKind, IntKind, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Encode,
    Decode,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Encode => f.write_str("encoding"),
            Direction::Decode => f.write_str("decoding"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Jump to target.
    Goto,
    /// Push `P`, `C`, `L`, `E` onto the recursion stack.
    SaveFrame,
    /// Restore roles from the top frame without popping it.
    LoadFrame,
    /// Pop the top frame.
    DropFrame,
    /// `P += offset`.
    Index,
    /// `P = *P` (a `Box`).
    Deref,
    /// Run the routine for a shape on `P`, through the cache.
    Recurse,
    /// Jump to `targets[R]`; fall through when `R` is out of range.
    Switch,
    /// `C = P`, `L = len`, `E = elem size` for a fixed-size array.
    ArrayBegin,
    /// If `L == 0` jump to target; otherwise `P = C`, `C += E`, `L -= 1`.
    SeqNext,

    EmitByte,
    EmitText,
    EmitBool,
    EmitInt,
    EmitFloat,
    EmitString,
    EmitBytes,
    EmitValue,
    EmitAny,
    /// Write `,` unless the last byte written is `{` or `[`.
    CommaUnlessOpen,
    /// Jump to target if the `width`-byte scalar at `P` is zero.
    BranchIfZero,
    /// Jump to target if the value at `P` is empty (string, sequence, map, none).
    BranchIfEmpty,
    /// `P = inner` for `Some`, else jump to target.
    OptionGet,
    /// `C`, `L`, `E` from the `Vec` at `P`.
    SeqBegin,
    /// `C` = a fresh iterator over the map at `P`.
    MapBegin,
    /// `P` = next key, or jump to target when exhausted.
    MapNext,
    /// `P` = value of the entry last returned by `MapNext`.
    MapValue,
    /// Release the innermost map iterator.
    MapEnd,

    /// Skip whitespace and require a byte.
    ExpectByte,
    /// Skip whitespace; if the next byte matches, consume it and jump.
    BranchIfByte,
    /// Skip whitespace; if the input holds `null`, consume it and jump.
    BranchIfNull,
    /// Require an opening byte; on anything else record a mismatch, skip the value and jump.
    OpenOrSkip,
    /// After an element: `,` continues, the closing byte jumps to target.
    CommaOrEnd,
    ReadBool,
    ReadInt,
    ReadFloat,
    ReadString,
    ReadBytes,
    ReadValue,
    ReadAny,
    SkipValue,
    /// Read an object key and the `:` after it; `R` = field index or -1.
    LookupField,
    /// Skip (or reject) the value of an unrecognized key.
    UnknownField,
    /// Make the option at `P` `Some` and point `P` at its inner value.
    OptionInit,
    OptionNone,
    SeqClear,
    /// Append a default element to the `Vec` at `P`; `P` = new element.
    SeqPush,
    MapClear,
    /// Read a key and `:`, insert a default value, `P` = the value.
    MapEntry,
}

/// Which [`Operand`] variant an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Target,
    Offset,
    Byte,
    ByteTarget,
    Text,
    Int,
    Float,
    Shape,
    ShapeTarget,
    Zero,
    Open,
    Fields,
    Targets,
}

impl Opcode {
    pub fn operand_kind(self) -> OperandKind {
        use Opcode::*;
        match self {
            Goto | SeqNext | MapNext | BranchIfNull => OperandKind::Target,
            Index => OperandKind::Offset,
            EmitByte | ExpectByte => OperandKind::Byte,
            BranchIfByte | CommaOrEnd => OperandKind::ByteTarget,
            EmitText => OperandKind::Text,
            EmitInt | ReadInt => OperandKind::Int,
            EmitFloat | ReadFloat => OperandKind::Float,
            Recurse | ArrayBegin | SeqBegin | MapBegin | OptionInit | OptionNone | SeqClear
            | SeqPush | MapClear | MapEntry => OperandKind::Shape,
            BranchIfEmpty | OptionGet => OperandKind::ShapeTarget,
            BranchIfZero => OperandKind::Zero,
            OpenOrSkip => OperandKind::Open,
            LookupField => OperandKind::Fields,
            Switch => OperandKind::Targets,
            SaveFrame | LoadFrame | DropFrame | Deref | EmitBool | EmitString | EmitBytes
            | EmitValue | EmitAny | CommaUnlessOpen | MapValue | MapEnd | ReadBool | ReadString
            | ReadBytes | ReadValue | ReadAny | SkipValue | UnknownField => OperandKind::None,
        }
    }

    /// The only direction this opcode is valid in, or `None` for both.
    pub fn direction(self) -> Option<Direction> {
        use Opcode::*;
        match self {
            Goto | SaveFrame | LoadFrame | DropFrame | Index | Deref | Recurse | Switch
            | ArrayBegin | SeqNext => None,
            EmitByte | EmitText | EmitBool | EmitInt | EmitFloat | EmitString | EmitBytes
            | EmitValue | EmitAny | CommaUnlessOpen | BranchIfZero | BranchIfEmpty | OptionGet
            | SeqBegin | MapBegin | MapNext | MapValue | MapEnd => Some(Direction::Encode),
            ExpectByte | BranchIfByte | BranchIfNull | OpenOrSkip | CommaOrEnd | ReadBool
            | ReadInt | ReadFloat | ReadString | ReadBytes | ReadValue | ReadAny | SkipValue
            | LookupField | UnknownField | OptionInit | OptionNone | SeqClear | SeqPush
            | MapClear | MapEntry => Some(Direction::Decode),
        }
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Goto => "goto",
            SaveFrame => "save_frame",
            LoadFrame => "load_frame",
            DropFrame => "drop_frame",
            Index => "index",
            Deref => "deref",
            Recurse => "recurse",
            Switch => "switch",
            ArrayBegin => "array_begin",
            SeqNext => "seq_next",
            EmitByte => "emit_byte",
            EmitText => "emit_text",
            EmitBool => "emit_bool",
            EmitInt => "emit_int",
            EmitFloat => "emit_float",
            EmitString => "emit_string",
            EmitBytes => "emit_bytes",
            EmitValue => "emit_value",
            EmitAny => "emit_any",
            CommaUnlessOpen => "comma_unless_open",
            BranchIfZero => "branch_if_zero",
            BranchIfEmpty => "branch_if_empty",
            OptionGet => "option_get",
            SeqBegin => "seq_begin",
            MapBegin => "map_begin",
            MapNext => "map_next",
            MapValue => "map_value",
            MapEnd => "map_end",
            ExpectByte => "expect_byte",
            BranchIfByte => "branch_if_byte",
            BranchIfNull => "branch_if_null",
            OpenOrSkip => "open_or_skip",
            CommaOrEnd => "comma_or_end",
            ReadBool => "read_bool",
            ReadInt => "read_int",
            ReadFloat => "read_float",
            ReadString => "read_string",
            ReadBytes => "read_bytes",
            ReadValue => "read_value",
            ReadAny => "read_any",
            SkipValue => "skip_value",
            LookupField => "lookup_field",
            UnknownField => "unknown_field",
            OptionInit => "option_init",
            OptionNone => "option_none",
            SeqClear => "seq_clear",
            SeqPush => "seq_push",
            MapClear => "map_clear",
            MapEntry => "map_entry",
        }
    }
}

#[derive(Clone)]
pub enum Operand {
    None,
    Target(usize),
    Offset(usize),
    Byte(u8),
    ByteTarget(u8, usize),
    Text(Box<[u8]>),
    Int(IntKind),
    Float(FloatKind),
    Shape(&'static Shape),
    ShapeTarget(&'static Shape, usize),
    Zero { width: u8, target: usize },
    Open { byte: u8, shape: &'static Shape, target: usize },
    Fields(Arc<FieldTable>),
    Targets(Box<[usize]>),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Target(_) => OperandKind::Target,
            Operand::Offset(_) => OperandKind::Offset,
            Operand::Byte(_) => OperandKind::Byte,
            Operand::ByteTarget(..) => OperandKind::ByteTarget,
            Operand::Text(_) => OperandKind::Text,
            Operand::Int(_) => OperandKind::Int,
            Operand::Float(_) => OperandKind::Float,
            Operand::Shape(_) => OperandKind::Shape,
            Operand::ShapeTarget(..) => OperandKind::ShapeTarget,
            Operand::Zero { .. } => OperandKind::Zero,
            Operand::Open { .. } => OperandKind::Open,
            Operand::Fields(_) => OperandKind::Fields,
            Operand::Targets(_) => OperandKind::Targets,
        }
    }

    /// Every jump target this operand names.
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Operand::Target(t)
            | Operand::ByteTarget(_, t)
            | Operand::ShapeTarget(_, t)
            | Operand::Zero { target: t, .. }
            | Operand::Open { target: t, .. } => vec![*t],
            Operand::Targets(ts) => ts.to_vec(),
            _ => Vec::new(),
        }
    }

    fn set_target(&mut self, to: usize) -> bool {
        match self {
            Operand::Target(t)
            | Operand::ByteTarget(_, t)
            | Operand::ShapeTarget(_, t)
            | Operand::Zero { target: t, .. }
            | Operand::Open { target: t, .. } => {
                *t = to;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct Instr {
    pub op: Opcode,
    pub operand: Operand,
}

/// Object keys a struct decode recognizes, in field order.
pub struct FieldTable {
    names: Box<[&'static str]>,
    exact: hashbrown::HashMap<&'static str, u32>,
    folded: hashbrown::HashMap<String, u32>,
}

impl FieldTable {
    pub fn new(names: Vec<&'static str>) -> Self {
        let mut exact = hashbrown::HashMap::with_capacity(names.len());
        let mut folded = hashbrown::HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            exact.entry(*name).or_insert(i as u32);
            folded.entry(name.to_lowercase()).or_insert(i as u32);
        }
        FieldTable {
            names: names.into_boxed_slice(),
            exact,
            folded,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&'static str> {
        self.names.get(index).copied()
    }

    /// Exact match first, then (unless `case_sensitive`) a case-insensitive one.
    pub fn lookup(&self, key: &[u8], case_sensitive: bool) -> Option<usize> {
        let key = core::str::from_utf8(key).ok()?;
        if let Some(&i) = self.exact.get(key) {
            return Some(i as usize);
        }
        if case_sensitive {
            return None;
        }
        self.folded.get(&key.to_lowercase()).map(|&i| i as usize)
    }
}

impl fmt::Debug for FieldTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names.iter()).finish()
    }
}

pub struct Program {
    pub direction: Direction,
    pub shape: &'static Shape,
    instrs: Vec<Instr>,
}

impl Program {
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Check operand kinds, directions and jump targets.
    ///
    /// A jump to `len()` (one past the last instruction) is allowed and means
    /// "return".
    pub fn validate(&self) -> Result<(), CompileError> {
        for (pc, instr) in self.instrs.iter().enumerate() {
            if instr.operand.kind() != instr.op.operand_kind() {
                return Err(CompileError::MalformedProgram {
                    pc,
                    reason: "operand does not match opcode",
                });
            }
            if let Some(dir) = instr.op.direction()
                && dir != self.direction
            {
                return Err(CompileError::WrongDirection {
                    pc,
                    op: instr.op,
                    direction: self.direction,
                });
            }
            if instr.operand.targets().iter().any(|&t| t > self.instrs.len()) {
                return Err(CompileError::MalformedProgram {
                    pc,
                    reason: "jump target outside program",
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Encode => "encode",
            Direction::Decode => "decode",
        };
        writeln!(f, "{dir} {}", self.shape.type_identifier)?;
        for (pc, instr) in self.instrs.iter().enumerate() {
            write!(f, "{pc:4}: {}", instr.op.name())?;
            match &instr.operand {
                Operand::None => {}
                Operand::Target(t) => write!(f, " -> {t}")?,
                Operand::Offset(o) => write!(f, " +{o}")?,
                Operand::Byte(b) => write!(f, " '{}'", b.escape_ascii())?,
                Operand::ByteTarget(b, t) => write!(f, " '{}' -> {t}", b.escape_ascii())?,
                Operand::Text(s) => write!(f, " \"{}\"", s.escape_ascii())?,
                Operand::Int(k) => write!(f, " {}", k.name())?,
                Operand::Float(k) => write!(f, " {}", k.name())?,
                Operand::Shape(s) => write!(f, " {}", s.type_identifier)?,
                Operand::ShapeTarget(s, t) => write!(f, " {} -> {t}", s.type_identifier)?,
                Operand::Zero { width, target } => write!(f, " w{width} -> {target}")?,
                Operand::Open {
                    byte,
                    shape,
                    target,
                } => write!(f, " '{}' {} -> {target}", byte.escape_ascii(), shape.type_identifier)?,
                Operand::Fields(table) => write!(f, " {table:?}")?,
                Operand::Targets(ts) => write!(f, " {ts:?}")?,
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Placeholder for a forward jump, filled in by [`ProgramBuilder::patch`].
pub const UNRESOLVED: usize = usize::MAX;

pub struct ProgramBuilder {
    direction: Direction,
    shape: &'static Shape,
    instrs: Vec<Instr>,
    /// Literals never merge backwards across a jump target.
    barrier: usize,
}

impl ProgramBuilder {
    pub fn new(direction: Direction, shape: &'static Shape) -> Self {
        ProgramBuilder {
            direction,
            shape,
            instrs: Vec::new(),
            barrier: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index of the next instruction.
    pub fn pc(&self) -> usize {
        self.instrs.len()
    }

    /// Index of the next instruction, marked as a jump target.
    pub fn label(&mut self) -> usize {
        self.barrier = self.instrs.len();
        self.barrier
    }

    pub fn push(&mut self, op: Opcode, operand: Operand) -> usize {
        let pc = self.instrs.len();
        self.instrs.push(Instr { op, operand });
        pc
    }

    pub fn op(&mut self, op: Opcode) -> usize {
        self.push(op, Operand::None)
    }

    /// Append literal output, merging with a directly preceding literal.
    pub fn text(&mut self, bytes: &[u8]) {
        if self.instrs.len() > self.barrier
            && let Some(last) = self.instrs.last_mut()
        {
            let merged = match &last.operand {
                Operand::Byte(b) if last.op == Opcode::EmitByte => Some([&[*b][..], bytes].concat()),
                Operand::Text(t) => Some([&t[..], bytes].concat()),
                _ => None,
            };
            if let Some(merged) = merged {
                *last = Instr {
                    op: Opcode::EmitText,
                    operand: Operand::Text(merged.into_boxed_slice()),
                };
                return;
            }
        }
        match bytes {
            [b] => self.push(Opcode::EmitByte, Operand::Byte(*b)),
            _ => self.push(Opcode::EmitText, Operand::Text(bytes.into())),
        };
    }

    /// Point the jump at `at` to `target`.
    pub fn patch(&mut self, at: usize, target: usize) {
        let patched = self.instrs[at].operand.set_target(target);
        debug_assert!(patched, "instruction {at} has no jump target");
    }

    pub fn patch_switch(&mut self, at: usize, index: usize, target: usize) {
        if let Operand::Targets(ts) = &mut self.instrs[at].operand {
            ts[index] = target;
        }
    }

    pub fn finish(self) -> Program {
        Program {
            direction: self.direction,
            shape: self.shape,
            instrs: self.instrs,
        }
    }
}
