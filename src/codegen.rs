//! Lowers a [`Program`] to native code through the active [`arch::EmitCtx`].
//!
//! Every instruction index gets a label, plus one for the end of the program,
//! so jumps can target any instruction or "return". Lowering is a single
//! forward pass; the assembler resolves forward references when finalized.

use std::sync::Arc;

use crate::error::CompileError;
use crate::ir::{FieldTable, Program};

/// Machine code for one program, plus the lookup tables its code points into.
pub struct Generated {
    pub code: Vec<u8>,
    /// Must outlive `code`: their addresses are embedded as immediates.
    pub tables: Vec<Arc<FieldTable>>,
}

#[cfg(not(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64")))]
pub fn generate(_program: &Program) -> Result<Generated, CompileError> {
    Err(CompileError::UnsupportedTarget)
}

#[cfg(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"))]
pub fn generate(program: &Program) -> Result<Generated, CompileError> {
    lower::generate(program)
}

#[cfg(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"))]
mod lower {
    use std::sync::Arc;

    use dynasmrt::DynamicLabel;
    use facet::Def;

    use super::Generated;
    use crate::arch::{Arg, EmitCtx, FrameLayout};
    use crate::error::CompileError;
    use crate::intrinsics as rt;
    use crate::ir::{Direction, FieldTable, Instr, Opcode, Operand, Program};
    use crate::shape::{self, Shape};

    fn shape_arg(shape: &'static Shape) -> Arg {
        Arg::Imm(shape as *const Shape as u64)
    }

    /// The container def of a list or array together with its element stride.
    fn elem_stride(shape: &'static Shape) -> Option<(Def, usize)> {
        let elem = match shape.def {
            Def::List(def) => def.t,
            Def::Array(def) => def.t,
            _ => return None,
        };
        Some((shape.def, shape::stride(elem)?))
    }

    pub(super) fn generate(program: &Program) -> Result<Generated, CompileError> {
        program.validate()?;
        let layout = FrameLayout::for_program(program);
        let mut lowerer = Lowerer {
            e: EmitCtx::new(program.direction, layout)?,
            direction: program.direction,
            labels: Vec::with_capacity(program.len() + 1),
            tables: Vec::new(),
        };
        for _ in 0..=program.len() {
            let label = lowerer.e.new_label();
            lowerer.labels.push(label);
        }

        lowerer.e.prologue();
        for (pc, instr) in program.instrs().iter().enumerate() {
            lowerer.e.bind(lowerer.labels[pc]);
            lowerer.lower(pc, instr)?;
        }
        lowerer.e.bind(lowerer.labels[program.len()]);
        lowerer.e.epilogue();

        let frame = lowerer.e.frame_size();
        let code = lowerer.e.finish()?;
        tracing::debug!(
            shape = program.shape.type_identifier,
            direction = %program.direction,
            instrs = program.len(),
            bytes = code.len(),
            frame,
            "generated routine"
        );
        Ok(Generated {
            code,
            tables: lowerer.tables,
        })
    }

    struct Lowerer {
        e: EmitCtx,
        direction: Direction,
        labels: Vec<DynamicLabel>,
        tables: Vec<Arc<FieldTable>>,
    }

    impl Lowerer {
        fn lower(&mut self, pc: usize, instr: &Instr) -> Result<(), CompileError> {
            let e = &mut self.e;
            match (instr.op, &instr.operand) {
                (Opcode::Goto, Operand::Target(t)) => {
                    let l = self.labels[*t];
                    e.jump(l);
                }
                (Opcode::Index, Operand::Offset(off)) => e.index(*off),
                (Opcode::Deref, Operand::None) => e.deref(),
                (Opcode::SaveFrame, Operand::None) => e.save_frame(),
                (Opcode::LoadFrame, Operand::None) => e.load_frame(),
                (Opcode::DropFrame, Operand::None) => e.drop_frame(),
                (Opcode::Recurse, Operand::Shape(shape)) => {
                    let target = match self.direction {
                        Direction::Encode => rt::jitson_encode_recurse as *const u8,
                        Direction::Decode => rt::jitson_decode_recurse as *const u8,
                    };
                    e.call(target, &[Arg::Ctx, Arg::Data, shape_arg(shape), Arg::Stack]);
                }
                (Opcode::Switch, Operand::Targets(targets)) => {
                    let labels: Vec<DynamicLabel> = targets.iter().map(|&t| self.labels[t]).collect();
                    e.switch(&labels);
                }
                (Opcode::ArrayBegin, Operand::Shape(shape)) => {
                    let Some((Def::Array(def), stride)) = elem_stride(shape) else {
                        return Err(CompileError::MalformedProgram {
                            pc,
                            reason: "array_begin on a shape that is not an array",
                        });
                    };
                    e.array_begin(def.n, stride);
                }
                (Opcode::SeqNext, Operand::Target(t)) => {
                    let l = self.labels[*t];
                    e.seq_next(l);
                }

                (Opcode::EmitByte, Operand::Byte(b)) => {
                    e.ensure(1);
                    e.write_bytes(&[*b]);
                }
                (Opcode::EmitText, Operand::Text(text)) => {
                    let Ok(n) = u32::try_from(text.len()) else {
                        return Err(CompileError::MalformedProgram {
                            pc,
                            reason: "literal too long",
                        });
                    };
                    e.ensure(n);
                    e.write_bytes(text);
                }
                (Opcode::EmitBool, Operand::None) => e.emit_bool(),
                (Opcode::EmitInt, Operand::Int(kind)) => e.call(rt::int_writer(*kind), &[Arg::Ctx, Arg::Data]),
                (Opcode::EmitFloat, Operand::Float(kind)) => {
                    e.call(rt::float_writer(*kind), &[Arg::Ctx, Arg::Data])
                }
                (Opcode::EmitString, Operand::None) => {
                    e.call(rt::jitson_write_str as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::EmitBytes, Operand::None) => {
                    e.call(rt::jitson_write_bytes as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::EmitValue, Operand::None) => {
                    e.call(rt::jitson_write_value as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::EmitAny, Operand::None) => {
                    e.call(rt::jitson_encode_any as *const u8, &[Arg::Ctx, Arg::Data, Arg::Stack])
                }
                (Opcode::CommaUnlessOpen, Operand::None) => e.comma_unless_open(),
                (Opcode::BranchIfZero, Operand::Zero { width, target }) => {
                    let l = self.labels[*target];
                    e.branch_if_zero(*width, l);
                }
                (Opcode::BranchIfEmpty, Operand::ShapeTarget(shape, t)) => {
                    let l = self.labels[*t];
                    e.call_pure(rt::jitson_is_empty as *const u8, &[Arg::Data, shape_arg(shape)]);
                    e.branch_ret_nonzero(l);
                }
                (Opcode::OptionGet, Operand::ShapeTarget(shape, t)) => {
                    let l = self.labels[*t];
                    e.call_pure(rt::jitson_opt_get as *const u8, &[Arg::Data, shape_arg(shape)]);
                    e.branch_ret_zero(l);
                    e.data_from_ret();
                }
                (Opcode::SeqBegin, Operand::Shape(shape)) => {
                    let Some((Def::List(_), stride)) = elem_stride(shape) else {
                        return Err(CompileError::MalformedProgram {
                            pc,
                            reason: "seq_begin on a shape that is not a sequence",
                        });
                    };
                    e.call_pure(
                        rt::jitson_seq_view as *const u8,
                        &[Arg::Data, shape_arg(shape), Arg::Scratch],
                    );
                    e.view_from_scratch();
                    e.set_elem(stride);
                }
                (Opcode::MapBegin, Operand::Shape(shape)) => {
                    e.call(
                        rt::jitson_map_iter_begin as *const u8,
                        &[Arg::Ctx, Arg::Data, shape_arg(shape)],
                    );
                    e.iter_from_ret();
                }
                (Opcode::MapNext, Operand::Target(t)) => {
                    let l = self.labels[*t];
                    e.call(rt::jitson_map_iter_next as *const u8, &[Arg::Ctx, Arg::Iter]);
                    e.branch_ret_zero(l);
                    e.data_from_ret();
                }
                (Opcode::MapValue, Operand::None) => {
                    e.call(rt::jitson_map_iter_value as *const u8, &[Arg::Ctx, Arg::Iter]);
                    e.data_from_ret();
                }
                (Opcode::MapEnd, Operand::None) => e.call(rt::jitson_map_iter_end as *const u8, &[Arg::Ctx]),

                (Opcode::ExpectByte, Operand::Byte(b)) => e.expect_byte(*b),
                (Opcode::BranchIfByte, Operand::ByteTarget(b, t)) => {
                    let l = self.labels[*t];
                    e.branch_if_byte(*b, l);
                }
                (Opcode::BranchIfNull, Operand::Target(t)) => {
                    let l = self.labels[*t];
                    e.branch_if_null(l);
                }
                (Opcode::OpenOrSkip, Operand::Open { byte, shape, target }) => {
                    let l = self.labels[*target];
                    e.open_or_skip(*byte, *shape as *const Shape as *const u8, l);
                }
                (Opcode::CommaOrEnd, Operand::ByteTarget(close, t)) => {
                    let l = self.labels[*t];
                    e.comma_or_end(*close, l);
                }
                (Opcode::ReadBool, Operand::None) => {
                    e.call(rt::jitson_read_bool as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::ReadInt, Operand::Int(kind)) => e.call(rt::int_reader(*kind), &[Arg::Ctx, Arg::Data]),
                (Opcode::ReadFloat, Operand::Float(kind)) => {
                    e.call(rt::float_reader(*kind), &[Arg::Ctx, Arg::Data])
                }
                (Opcode::ReadString, Operand::None) => {
                    e.call(rt::jitson_read_string as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::ReadBytes, Operand::None) => {
                    e.call(rt::jitson_read_bytes as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::ReadValue, Operand::None) => {
                    e.call(rt::jitson_read_value as *const u8, &[Arg::Ctx, Arg::Data])
                }
                (Opcode::ReadAny, Operand::None) => {
                    e.call(rt::jitson_decode_any as *const u8, &[Arg::Ctx, Arg::Data, Arg::Stack])
                }
                (Opcode::SkipValue, Operand::None) => e.call(rt::jitson_skip_value as *const u8, &[Arg::Ctx]),
                (Opcode::LookupField, Operand::Fields(table)) => {
                    let ptr = Arc::as_ptr(table) as u64;
                    self.tables.push(Arc::clone(table));
                    e.call(rt::jitson_lookup_field as *const u8, &[Arg::Ctx, Arg::Imm(ptr)]);
                    e.result_from_ret();
                }
                (Opcode::UnknownField, Operand::None) => {
                    e.call(rt::jitson_unknown_field as *const u8, &[Arg::Ctx])
                }
                (Opcode::OptionInit, Operand::Shape(shape)) => {
                    e.call_pure(rt::jitson_opt_init as *const u8, &[Arg::Data, shape_arg(shape)]);
                    e.data_from_ret();
                }
                (Opcode::OptionNone, Operand::Shape(shape)) => {
                    e.call_pure(rt::jitson_opt_clear as *const u8, &[Arg::Data, shape_arg(shape)])
                }
                (Opcode::SeqClear, Operand::Shape(shape)) => {
                    e.call_pure(rt::jitson_seq_clear as *const u8, &[Arg::Data, shape_arg(shape)])
                }
                (Opcode::SeqPush, Operand::Shape(shape)) => {
                    e.call_pure(rt::jitson_seq_push as *const u8, &[Arg::Data, shape_arg(shape)]);
                    e.data_from_ret();
                }
                (Opcode::MapClear, Operand::Shape(shape)) => {
                    e.call_pure(rt::jitson_map_clear as *const u8, &[Arg::Data, shape_arg(shape)])
                }
                (Opcode::MapEntry, Operand::Shape(shape)) => {
                    e.call(
                        rt::jitson_map_entry as *const u8,
                        &[Arg::Ctx, Arg::Data, shape_arg(shape)],
                    );
                    e.data_from_ret();
                }

                _ => {
                    return Err(CompileError::MalformedProgram {
                        pc,
                        reason: "operand does not match opcode",
                    });
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ir::{Direction, Opcode, Operand, ProgramBuilder};
    use crate::shape::Facet;

    #[test]
    fn wrong_direction_is_rejected_before_emission() {
        let mut b = ProgramBuilder::new(Direction::Decode, u32::SHAPE);
        b.op(Opcode::EmitString);
        let err = generate(&b.finish()).err().unwrap();
        assert!(matches!(
            err,
            CompileError::WrongDirection { op: Opcode::EmitString, .. } | CompileError::UnsupportedTarget
        ));
    }

    #[test]
    fn bad_jump_is_rejected() {
        let mut b = ProgramBuilder::new(Direction::Encode, u32::SHAPE);
        b.push(Opcode::Goto, Operand::Target(9));
        assert!(generate(&b.finish()).is_err());
    }

    #[cfg(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"))]
    #[test]
    fn planned_programs_lower_in_both_directions() {
        #[derive(Facet, Default)]
        #[facet(traits(Default))]
        struct Row {
            id: u64,
            tags: Vec<String>,
            score: Option<f32>,
            grid: [u16; 3],
        }

        for direction in [Direction::Encode, Direction::Decode] {
            let program = crate::plan::plan(Row::SHAPE, direction, &Config::default()).unwrap();
            let generated = generate(&program).unwrap();
            assert!(!generated.code.is_empty());
            assert_eq!(generated.tables.len(), usize::from(direction == Direction::Decode));
        }
    }

    #[cfg(not(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64")))]
    #[test]
    fn unsupported_targets_say_so() {
        let program = crate::plan::plan(u32::SHAPE, Direction::Encode, &Config::default()).unwrap();
        assert!(matches!(generate(&program), Err(CompileError::UnsupportedTarget)));
    }
}
