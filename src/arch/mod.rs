//! Per-ISA code emission.
//!
//! Both backends expose the same `EmitCtx` surface; `codegen` drives it one
//! instruction at a time. Where each role lives is spelled out in a
//! [`RoleTable`] that is checked for aliasing before any code is emitted.

use core::fmt;

use crate::error::CompileError;
use crate::ir::{Opcode, Program};

#[cfg(all(target_arch = "x86_64", not(windows)))]
mod x64;

#[cfg(all(target_arch = "x86_64", not(windows)))]
pub use x64::EmitCtx;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::EmitCtx;

/// Whether this build has a code generator.
pub const SUPPORTED: bool = cfg!(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"));

/// A value generated code keeps live for the whole routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ctx,
    /// Encode: output buffer base.
    Buf,
    /// Encode: bytes written.
    Len,
    /// Encode: buffer capacity.
    Cap,
    /// Decode: next unread byte.
    Cursor,
    /// Decode: one past the last input byte.
    End,
    /// `P`
    Data,
    /// `C`
    Iter,
    /// `L`
    Count,
    /// `E`
    Elem,
    /// Pointer to the `RecursionStack`.
    Stack,
    /// `R`
    Result,
    /// Two words of memory whose address is handed to runtime support.
    Scratch,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Ctx => "ctx",
            Role::Buf => "buf",
            Role::Len => "len",
            Role::Cap => "cap",
            Role::Cursor => "cursor",
            Role::End => "end",
            Role::Data => "data",
            Role::Iter => "iter",
            Role::Count => "count",
            Role::Elem => "elem",
            Role::Stack => "stack",
            Role::Result => "result",
            Role::Scratch => "scratch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// A callee-saved register, by hardware number.
    Reg(u8),
    /// Bytes `[off, off + size)` above the stack pointer after the prologue.
    Slot { off: u32, size: u32 },
}

impl Loc {
    fn overlaps(self, other: Loc) -> bool {
        match (self, other) {
            (Loc::Reg(a), Loc::Reg(b)) => a == b,
            (Loc::Slot { off: a, size: sa }, Loc::Slot { off: b, size: sb }) => a < b + sb && b < a + sa,
            _ => false,
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Reg(r) => write!(f, "r{r}"),
            Loc::Slot { off, size } => write!(f, "[sp+{off}; {size}]"),
        }
    }
}

/// Where every role of one routine lives.
#[derive(Debug, Clone)]
pub struct RoleTable {
    entries: Vec<(Role, Loc)>,
}

impl RoleTable {
    /// Fails if two roles share a register or overlapping stack bytes.
    pub fn new(entries: Vec<(Role, Loc)>) -> Result<Self, CompileError> {
        for (i, (a, la)) in entries.iter().enumerate() {
            for (b, lb) in &entries[i + 1..] {
                if la.overlaps(*lb) || a == b {
                    return Err(CompileError::RoleConflict {
                        first: a.name(),
                        second: b.name(),
                    });
                }
            }
        }
        Ok(RoleTable { entries })
    }

    pub fn get(&self, role: Role) -> Option<Loc> {
        self.entries.iter().find(|(r, _)| *r == role).map(|(_, l)| *l)
    }

    pub fn entries(&self) -> &[(Role, Loc)] {
        &self.entries
    }

    /// Register a role must live in; roles on the fast path are never spilled.
    pub(crate) fn reg(&self, role: Role) -> Result<u8, CompileError> {
        match self.get(role) {
            Some(Loc::Reg(r)) => Ok(r),
            _ => Err(CompileError::Assembly(format!("role {} must live in a register", role.name()))),
        }
    }
}

impl fmt::Display for RoleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (role, loc) in &self.entries {
            writeln!(f, "{:>8} {loc}", role.name())?;
        }
        Ok(())
    }
}

/// Which optional locals a program needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLayout {
    /// `L` and `E`: loops or frames.
    pub loop_state: bool,
    /// `R`: field lookups.
    pub result: bool,
    /// Scratch words for runtime support out-parameters.
    pub scratch: bool,
}

impl FrameLayout {
    pub fn for_program(program: &Program) -> Self {
        let mut layout = FrameLayout::default();
        for instr in program.instrs() {
            match instr.op {
                Opcode::SaveFrame | Opcode::LoadFrame | Opcode::SeqNext | Opcode::ArrayBegin => {
                    layout.loop_state = true
                }
                Opcode::SeqBegin => {
                    layout.loop_state = true;
                    layout.scratch = true;
                }
                Opcode::LookupField | Opcode::Switch => layout.result = true,
                _ => {}
            }
        }
        layout
    }
}

/// Argument passed to runtime support, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Ctx,
    /// Address of the context's error slot.
    ErrorSlot,
    Data,
    Iter,
    Stack,
    Scratch,
    Imm(u64),
}

/// Allocates `Slot` locations bottom-up.
pub(crate) struct SlotAlloc {
    next: u32,
}

impl SlotAlloc {
    pub(crate) fn new() -> Self {
        SlotAlloc { next: 0 }
    }

    pub(crate) fn take(&mut self, size: u32) -> Loc {
        let off = self.next;
        self.next += size;
        Loc::Slot { off, size }
    }

    pub(crate) fn used(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliasing_roles_are_rejected() {
        let err = RoleTable::new(vec![
            (Role::Ctx, Loc::Reg(15)),
            (Role::Data, Loc::Reg(3)),
            (Role::Iter, Loc::Reg(15)),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::RoleConflict {
                first: "ctx",
                second: "iter"
            }
        );

        let err = RoleTable::new(vec![
            (Role::Scratch, Loc::Slot { off: 0, size: 16 }),
            (Role::Count, Loc::Slot { off: 8, size: 8 }),
        ])
        .unwrap_err();
        assert!(matches!(err, CompileError::RoleConflict { .. }));
    }

    #[test]
    fn adjacent_slots_do_not_alias() {
        let mut slots = SlotAlloc::new();
        let a = slots.take(8);
        let b = slots.take(16);
        let table = RoleTable::new(vec![(Role::Stack, a), (Role::Scratch, b)]).unwrap();
        assert_eq!(table.get(Role::Scratch), Some(Loc::Slot { off: 8, size: 16 }));
        assert_eq!(slots.used(), 24);
        assert!(table.reg(Role::Stack).is_err());
    }

    #[test]
    fn layout_tracks_required_locals() {
        use crate::config::Config;
        use crate::ir::Direction;
        use crate::shape::Facet;

        let program = crate::plan::plan(<Vec<u32>>::SHAPE, Direction::Encode, &Config::default()).unwrap();
        let layout = FrameLayout::for_program(&program);
        assert!(layout.loop_state && layout.scratch);
        assert!(!layout.result);

        let program = crate::plan::plan(u32::SHAPE, Direction::Decode, &Config::default()).unwrap();
        assert_eq!(FrameLayout::for_program(&program), FrameLayout::default());
    }
}
