//! Turns a [`Shape`] into a [`Program`] for one direction.
//!
//! Statically-known nesting is inlined. Every composite that needs its
//! registers back after a nested value brackets that value with frames.
//! Self-referential shapes, and nesting past `max_inline_depth`, become
//! [`Opcode::Recurse`] calls that resolve through the cache at run time.

use std::sync::Arc;

use crate::config::Config;
use crate::error::CompileError;
use crate::ir::{Direction, FieldTable, Opcode, Operand, Program, ProgramBuilder, UNRESOLVED};
use facet::{ArrayDef, ListDef, MapDef, StructType};

use crate::shape::{self, FieldFlags, FieldInfo, Shape, ShapeKey, ShapeKind};

pub fn plan(shape: &'static Shape, direction: Direction, config: &Config) -> Result<Program, CompileError> {
    let depth = static_depth(shape, &mut Vec::new());
    if depth > config.max_depth {
        return Err(CompileError::NestingTooDeep {
            type_name: shape.type_identifier,
            depth,
        });
    }

    let mut planner = Planner {
        b: ProgramBuilder::new(direction, shape),
        config,
        path: Vec::new(),
    };
    match direction {
        Direction::Encode => planner.encode_value(shape, false)?,
        Direction::Decode => planner.decode_value(shape, false)?,
    }
    let program = planner.b.finish();
    if program.len() > config.max_program_len {
        return Err(CompileError::ProgramTooLong {
            len: program.len(),
            max: config.max_program_len,
        });
    }
    program.validate()?;
    tracing::debug!(
        shape = shape.type_identifier,
        %direction,
        instrs = program.len(),
        "planned program"
    );
    Ok(program)
}

fn kind_of(shape: &'static Shape) -> Result<ShapeKind, CompileError> {
    ShapeKind::of(shape).map_err(|reason| CompileError::UnsupportedShape {
        type_name: shape.type_identifier,
        reason,
    })
}

fn require(shape: &'static Shape, ok: bool, reason: &'static str) -> Result<(), CompileError> {
    if ok {
        Ok(())
    } else {
        Err(CompileError::UnsupportedShape {
            type_name: shape.type_identifier,
            reason,
        })
    }
}

fn is_composite(shape: &'static Shape) -> bool {
    matches!(
        ShapeKind::of(shape),
        Ok(ShapeKind::Struct(_) | ShapeKind::Seq(_) | ShapeKind::Array(_) | ShapeKind::Map(_))
    )
}

/// Deepest chain of nested objects and arrays, not following cycles.
fn static_depth(shape: &'static Shape, path: &mut Vec<ShapeKey>) -> usize {
    let key = ShapeKey::new(shape);
    if path.contains(&key) {
        return 0;
    }
    path.push(key);
    let below = shape::children(shape)
        .into_iter()
        .map(|child| static_depth(child, path))
        .max()
        .unwrap_or(0);
    path.pop();
    below + usize::from(is_composite(shape))
}

struct Planner<'c> {
    b: ProgramBuilder,
    config: &'c Config,
    /// Composites currently being inlined, outermost first.
    path: Vec<ShapeKey>,
}

impl Planner<'_> {
    /// Emit `Recurse` instead of inlining when the shape is already being
    /// inlined or the inline budget is spent.
    fn should_recurse(&self, shape: &'static Shape) -> bool {
        self.path.contains(&ShapeKey::new(shape)) || self.path.len() >= self.config.max_inline_depth.max(1)
    }

    fn index(&mut self, offset: usize) {
        if offset != 0 {
            self.b.push(Opcode::Index, Operand::Offset(offset));
        }
    }

    fn goto_unresolved(&mut self) -> usize {
        self.b.push(Opcode::Goto, Operand::Target(UNRESOLVED))
    }

    fn bind(&mut self, jumps: &[usize]) -> usize {
        let here = self.b.label();
        for &j in jumps {
            self.b.patch(j, here);
        }
        here
    }

    fn composite(
        &mut self,
        shape: &'static Shape,
        body: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        if self.should_recurse(shape) {
            self.b.push(Opcode::Recurse, Operand::Shape(shape));
            return Ok(());
        }
        self.path.push(ShapeKey::new(shape));
        let result = body(self);
        self.path.pop();
        result
    }

    fn encode_value(&mut self, shape: &'static Shape, quoted: bool) -> Result<(), CompileError> {
        match kind_of(shape)? {
            ShapeKind::Unit => self.b.text(b"null"),
            ShapeKind::Bool => self.quoted(quoted, |p| {
                p.b.op(Opcode::EmitBool);
            }),
            ShapeKind::Int(kind) => self.quoted(quoted, |p| {
                p.b.push(Opcode::EmitInt, Operand::Int(kind));
            }),
            ShapeKind::Float(kind) => self.quoted(quoted, |p| {
                p.b.push(Opcode::EmitFloat, Operand::Float(kind));
            }),
            ShapeKind::String => {
                self.b.op(Opcode::EmitString);
            }
            ShapeKind::Bytes => {
                self.b.op(Opcode::EmitBytes);
            }
            ShapeKind::Dynamic => {
                self.b.op(Opcode::EmitValue);
            }
            ShapeKind::Any => {
                self.b.op(Opcode::EmitAny);
            }
            ShapeKind::Pointer(pointee) => {
                self.b.op(Opcode::Deref);
                self.encode_value(pointee, quoted)?;
            }
            ShapeKind::Option(def) => {
                let none = self.b.push(Opcode::OptionGet, Operand::ShapeTarget(shape, UNRESOLVED));
                self.encode_value(def.t, quoted)?;
                let done = self.goto_unresolved();
                self.bind(&[none]);
                self.b.text(b"null");
                self.bind(&[done]);
            }
            ShapeKind::Struct(st) => self.composite(shape, |p| p.encode_struct(st))?,
            ShapeKind::Seq(def) => {
                require(shape, def.vtable.as_ptr.is_some(), "list has no contiguous storage")?;
                self.composite(shape, |p| p.encode_seq(shape, def))?
            }
            ShapeKind::Array(def) => self.composite(shape, |p| p.encode_array(shape, def))?,
            ShapeKind::Map(def) => {
                require(
                    shape,
                    def.vtable.iter_vtable.init_with_value.is_some(),
                    "map cannot be iterated",
                )?;
                self.composite(shape, |p| p.encode_map(shape, def))?
            }
        }
        Ok(())
    }

    fn quoted(&mut self, quoted: bool, emit: impl FnOnce(&mut Self)) {
        if quoted {
            self.b.text(b"\"");
        }
        emit(self);
        if quoted {
            self.b.text(b"\"");
        }
    }

    /// Emit a jump over an `OMIT_EMPTY` field, if the field's type has an
    /// empty state. `P` must point at the field.
    fn encode_empty_test(&mut self, shape: &'static Shape) -> Option<usize> {
        let zero = |width: u8| Operand::Zero {
            width,
            target: UNRESOLVED,
        };
        match ShapeKind::of(shape).ok()? {
            ShapeKind::Bool => Some(self.b.push(Opcode::BranchIfZero, zero(1))),
            ShapeKind::Int(kind) => Some(self.b.push(Opcode::BranchIfZero, zero(kind.size() as u8))),
            ShapeKind::Float(_)
            | ShapeKind::String
            | ShapeKind::Bytes
            | ShapeKind::Seq(_)
            | ShapeKind::Map(_)
            | ShapeKind::Option(_)
            | ShapeKind::Dynamic
            | ShapeKind::Any => {
                Some(self.b.push(Opcode::BranchIfEmpty, Operand::ShapeTarget(shape, UNRESOLVED)))
            }
            _ => None,
        }
    }

    fn encode_struct(&mut self, st: &'static StructType) -> Result<(), CompileError> {
        let fields: Vec<FieldInfo> = shape::fields(st)
            .into_iter()
            .filter(|f| !f.flags.contains(FieldFlags::SKIP_ENCODE))
            .filter(|f| !is_always_empty(f))
            .collect();
        if fields.is_empty() {
            self.b.text(b"{}");
            return Ok(());
        }

        self.b.op(Opcode::SaveFrame);
        self.b.text(b"{");
        // A field is surely written before this one: the comma is static.
        let mut comma_known = false;
        // Some earlier field may have been written.
        let mut comma_maybe = false;
        let mut p_moved = false;

        for field in fields {
            let shape = field.shape;
            let mut skip = None;
            if field.flags.contains(FieldFlags::OMIT_EMPTY) {
                if p_moved {
                    self.b.op(Opcode::LoadFrame);
                }
                self.index(field.offset);
                skip = self.encode_empty_test(shape);
                p_moved = field.offset != 0 || p_moved;
            }

            let key = json_key(field.name);
            if comma_known {
                self.b.text(&[b",".as_slice(), &key].concat());
            } else if comma_maybe {
                self.b.op(Opcode::CommaUnlessOpen);
                self.b.text(&key);
            } else {
                self.b.text(&key);
            }

            if p_moved {
                self.b.op(Opcode::LoadFrame);
            }
            self.index(field.offset);
            self.encode_value(shape, field.flags.contains(FieldFlags::QUOTED))?;
            p_moved = true;

            match skip {
                Some(jump) => {
                    self.bind(&[jump]);
                }
                None => comma_known = true,
            }
            comma_maybe = true;
        }

        self.b.text(b"}");
        self.b.op(Opcode::DropFrame);
        Ok(())
    }

    /// Shared element loop. `C`, `L`, `E` are already set up.
    fn encode_elements(&mut self, elem: &'static Shape) -> Result<(), CompileError> {
        let top = self.b.label();
        let next = self.b.push(Opcode::SeqNext, Operand::Target(UNRESOLVED));
        self.b.op(Opcode::CommaUnlessOpen);
        self.b.op(Opcode::SaveFrame);
        self.encode_value(elem, false)?;
        self.b.op(Opcode::LoadFrame);
        self.b.op(Opcode::DropFrame);
        self.b.push(Opcode::Goto, Operand::Target(top));
        self.bind(&[next]);
        Ok(())
    }

    fn encode_seq(&mut self, shape: &'static Shape, def: &'static ListDef) -> Result<(), CompileError> {
        self.b.push(Opcode::SeqBegin, Operand::Shape(shape));
        self.b.text(b"[");
        self.encode_elements(def.t)?;
        self.b.text(b"]");
        Ok(())
    }

    fn encode_array(&mut self, shape: &'static Shape, def: &'static ArrayDef) -> Result<(), CompileError> {
        if def.n == 0 {
            self.b.text(b"[]");
            return Ok(());
        }
        self.b.push(Opcode::ArrayBegin, Operand::Shape(shape));
        self.b.text(b"[");
        self.encode_elements(def.t)?;
        self.b.text(b"]");
        Ok(())
    }

    fn encode_map(&mut self, shape: &'static Shape, def: &'static MapDef) -> Result<(), CompileError> {
        self.b.push(Opcode::MapBegin, Operand::Shape(shape));
        self.b.text(b"{");
        let top = self.b.label();
        let next = self.b.push(Opcode::MapNext, Operand::Target(UNRESOLVED));
        self.b.op(Opcode::CommaUnlessOpen);
        self.b.op(Opcode::EmitString);
        self.b.text(b":");
        self.b.op(Opcode::MapValue);
        self.b.op(Opcode::SaveFrame);
        self.encode_value(def.v, false)?;
        self.b.op(Opcode::LoadFrame);
        self.b.op(Opcode::DropFrame);
        self.b.push(Opcode::Goto, Operand::Target(top));
        self.bind(&[next]);
        self.b.op(Opcode::MapEnd);
        self.b.text(b"}");
        Ok(())
    }

    fn decode_value(&mut self, shape: &'static Shape, quoted: bool) -> Result<(), CompileError> {
        match kind_of(shape)? {
            ShapeKind::Unit => {
                self.b.op(Opcode::SkipValue);
            }
            ShapeKind::Bool => self.unquote(shape, quoted, |p| {
                p.b.op(Opcode::ReadBool);
            }),
            ShapeKind::Int(kind) => self.unquote(shape, quoted, |p| {
                p.b.push(Opcode::ReadInt, Operand::Int(kind));
            }),
            ShapeKind::Float(kind) => self.unquote(shape, quoted, |p| {
                p.b.push(Opcode::ReadFloat, Operand::Float(kind));
            }),
            ShapeKind::String => {
                self.b.op(Opcode::ReadString);
            }
            ShapeKind::Bytes => {
                self.b.op(Opcode::ReadBytes);
            }
            ShapeKind::Dynamic => {
                self.b.op(Opcode::ReadValue);
            }
            ShapeKind::Any => {
                self.b.op(Opcode::ReadAny);
            }
            ShapeKind::Pointer(pointee) => {
                self.b.op(Opcode::Deref);
                self.decode_value(pointee, quoted)?;
            }
            ShapeKind::Option(def) => {
                require(shape, shape::has_default(def.t), "option payload has no default")?;
                let null = self.b.push(Opcode::BranchIfNull, Operand::Target(UNRESOLVED));
                self.b.push(Opcode::OptionInit, Operand::Shape(shape));
                self.decode_value(def.t, quoted)?;
                let done = self.goto_unresolved();
                self.bind(&[null]);
                self.b.push(Opcode::OptionNone, Operand::Shape(shape));
                self.bind(&[done]);
            }
            ShapeKind::Struct(st) => self.composite(shape, |p| p.decode_struct(shape, st))?,
            ShapeKind::Seq(def) => {
                require(
                    shape,
                    def.push().is_some()
                        && def.init_in_place_with_capacity().is_some()
                        && def.vtable.as_mut_ptr.is_some(),
                    "list cannot be grown in place",
                )?;
                require(shape, shape::has_default(def.t), "list element has no default")?;
                self.composite(shape, |p| p.decode_seq(shape, def))?
            }
            ShapeKind::Array(def) => self.composite(shape, |p| p.decode_array(shape, def))?,
            ShapeKind::Map(def) => {
                require(shape, shape::has_default(def.v), "map value has no default")?;
                self.composite(shape, |p| p.decode_map(shape, def))?
            }
        }
        Ok(())
    }

    /// A quoted scalar: `null` leaves the target alone and anything other
    /// than a string is skipped as a mismatch.
    fn unquote(&mut self, shape: &'static Shape, quoted: bool, read: impl FnOnce(&mut Self)) {
        if !quoted {
            read(self);
            return;
        }
        let null = self.b.push(Opcode::BranchIfNull, Operand::Target(UNRESOLVED));
        let mismatch = self.b.push(
            Opcode::OpenOrSkip,
            Operand::Open {
                byte: b'"',
                shape,
                target: UNRESOLVED,
            },
        );
        read(self);
        self.b.push(Opcode::ExpectByte, Operand::Byte(b'"'));
        self.bind(&[null, mismatch]);
    }

    /// Opening bracket handling shared by every composite decode: `null`
    /// leaves the target alone, a mismatched value is skipped, an empty
    /// container ends immediately. Returns the jumps that lead to the end.
    fn decode_open(&mut self, shape: &'static Shape, open: u8, close: u8) -> Vec<usize> {
        let null = self.b.push(Opcode::BranchIfNull, Operand::Target(UNRESOLVED));
        let mismatch = self.b.push(
            Opcode::OpenOrSkip,
            Operand::Open {
                byte: open,
                shape,
                target: UNRESOLVED,
            },
        );
        let empty = self.b.push(Opcode::BranchIfByte, Operand::ByteTarget(close, UNRESOLVED));
        vec![null, mismatch, empty]
    }

    fn decode_struct(&mut self, shape: &'static Shape, st: &'static StructType) -> Result<(), CompileError> {
        let fields: Vec<FieldInfo> = shape::fields(st)
            .into_iter()
            .filter(|f| !f.flags.contains(FieldFlags::SKIP_DECODE))
            .collect();
        let table = Arc::new(FieldTable::new(fields.iter().map(|f| f.name).collect()));

        self.b.op(Opcode::SaveFrame);
        let mut to_end = self.decode_open(shape, b'{', b'}');
        let top = self.b.label();
        self.b.push(Opcode::LookupField, Operand::Fields(table));
        let switch = self.b.push(
            Opcode::Switch,
            Operand::Targets(vec![UNRESOLVED; fields.len()].into_boxed_slice()),
        );
        self.b.op(Opcode::UnknownField);
        let mut to_next = vec![self.goto_unresolved()];

        for (i, field) in fields.iter().enumerate() {
            let here = self.b.label();
            self.b.patch_switch(switch, i, here);
            self.b.op(Opcode::LoadFrame);
            self.index(field.offset);
            self.decode_value(field.shape, field.flags.contains(FieldFlags::QUOTED))?;
            if i + 1 < fields.len() {
                to_next.push(self.goto_unresolved());
            }
        }

        self.bind(&to_next);
        to_end.push(self.b.push(Opcode::CommaOrEnd, Operand::ByteTarget(b'}', UNRESOLVED)));
        self.b.push(Opcode::Goto, Operand::Target(top));
        self.bind(&to_end);
        self.b.op(Opcode::DropFrame);
        Ok(())
    }

    fn decode_seq(&mut self, shape: &'static Shape, def: &'static ListDef) -> Result<(), CompileError> {
        self.b.push(Opcode::SeqClear, Operand::Shape(shape));
        self.b.op(Opcode::SaveFrame);
        let mut to_end = self.decode_open(shape, b'[', b']');
        let top = self.b.label();
        self.b.op(Opcode::LoadFrame);
        self.b.push(Opcode::SeqPush, Operand::Shape(shape));
        self.decode_value(def.t, false)?;
        to_end.push(self.b.push(Opcode::CommaOrEnd, Operand::ByteTarget(b']', UNRESOLVED)));
        self.b.push(Opcode::Goto, Operand::Target(top));
        self.bind(&to_end);
        self.b.op(Opcode::DropFrame);
        Ok(())
    }

    fn decode_array(&mut self, shape: &'static Shape, def: &'static ArrayDef) -> Result<(), CompileError> {
        self.b.op(Opcode::SaveFrame);
        let mut to_end = self.decode_open(shape, b'[', b']');
        self.b.push(Opcode::ArrayBegin, Operand::Shape(shape));
        let top = self.b.label();
        let full = self.b.push(Opcode::SeqNext, Operand::Target(UNRESOLVED));
        self.b.op(Opcode::SaveFrame);
        self.decode_value(def.t, false)?;
        self.b.op(Opcode::LoadFrame);
        self.b.op(Opcode::DropFrame);
        let next = self.goto_unresolved();
        // Elements past the array's length are skipped.
        self.bind(&[full]);
        self.b.op(Opcode::SkipValue);
        self.bind(&[next]);
        to_end.push(self.b.push(Opcode::CommaOrEnd, Operand::ByteTarget(b']', UNRESOLVED)));
        self.b.push(Opcode::Goto, Operand::Target(top));
        self.bind(&to_end);
        self.b.op(Opcode::DropFrame);
        Ok(())
    }

    fn decode_map(&mut self, shape: &'static Shape, def: &'static MapDef) -> Result<(), CompileError> {
        self.b.push(Opcode::MapClear, Operand::Shape(shape));
        self.b.op(Opcode::SaveFrame);
        let mut to_end = self.decode_open(shape, b'{', b'}');
        let top = self.b.label();
        self.b.op(Opcode::LoadFrame);
        self.b.push(Opcode::MapEntry, Operand::Shape(shape));
        self.decode_value(def.v, false)?;
        to_end.push(self.b.push(Opcode::CommaOrEnd, Operand::ByteTarget(b'}', UNRESOLVED)));
        self.b.push(Opcode::Goto, Operand::Target(top));
        self.bind(&to_end);
        self.b.op(Opcode::DropFrame);
        Ok(())
    }
}

/// `OMIT_EMPTY` on a zero-length array: the field is never written.
fn is_always_empty(field: &FieldInfo) -> bool {
    field.flags.contains(FieldFlags::OMIT_EMPTY) && matches!(ShapeKind::of(field.shape), Ok(ShapeKind::Array(def)) if def.n == 0)
}

/// `"name":` with the name escaped as a JSON string.
fn json_key(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 3);
    crate::scan::escape_str(&mut out, name, false);
    out.push(b':');
    out
}
