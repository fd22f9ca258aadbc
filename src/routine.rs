use std::fmt;
use std::sync::Arc;

use crate::codegen;
use crate::config::Config;
use crate::context::{DecodeContext, EncodeContext};
use crate::error::CompileError;
use crate::ir::{Direction, FieldTable, Program};
use crate::plan;
use crate::pool::{ExecPage, MemoryPool};
use crate::shape::Shape;
use crate::stack::RecursionStack;

/// Signature shared by every generated routine.
///
/// `ctx` is an [`EncodeContext`] or [`DecodeContext`] matching the routine's
/// direction, `data` the value being read or filled, `flags` the context's
/// option bits. Returns the context's error code, zero on success.
pub type EntryFn = unsafe extern "C" fn(ctx: *mut u8, data: *mut u8, stack: *mut RecursionStack, flags: u64) -> u32;

/// Native code for one (shape, direction) pair.
pub struct CompiledRoutine {
    direction: Direction,
    shape: &'static Shape,
    page: ExecPage,
    func: EntryFn,
    instrs: usize,
    // Generated code holds raw pointers into these.
    _tables: Vec<Arc<FieldTable>>,
}

impl CompiledRoutine {
    /// Plan, lower, and place a routine for `shape`.
    pub fn compile(
        shape: &'static Shape,
        direction: Direction,
        config: &Config,
        pool: &Arc<MemoryPool>,
    ) -> Result<Self, CompileError> {
        let program = plan::plan(shape, direction, config)?;
        Self::from_program(&program, pool)
    }

    /// Lower an already-built program.
    pub fn from_program(program: &Program, pool: &Arc<MemoryPool>) -> Result<Self, CompileError> {
        let generated = codegen::generate(program)?;
        let page = pool.alloc_exec(&generated.code)?;
        // SAFETY: the page holds a complete routine starting at offset zero,
        // generated against the `EntryFn` calling convention.
        let func: EntryFn = unsafe { core::mem::transmute::<*const u8, EntryFn>(page.entry()) };
        tracing::debug!(
            shape = program.shape.type_identifier,
            direction = %program.direction,
            bytes = generated.code.len(),
            "compiled routine"
        );
        Ok(CompiledRoutine {
            direction: program.direction,
            shape: program.shape,
            page,
            func,
            instrs: program.len(),
            _tables: generated.tables,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn shape(&self) -> &'static Shape {
        self.shape
    }

    /// The raw executable code.
    pub fn code(&self) -> &[u8] {
        self.page.code()
    }

    /// Number of IR instructions the routine was lowered from.
    pub fn instr_count(&self) -> usize {
        self.instrs
    }

    /// Run an encode routine over `src`.
    ///
    /// # Safety
    /// `src` must point to a live value of this routine's shape, and the
    /// routine must encode.
    pub(crate) unsafe fn run_encode(
        &self,
        ctx: &mut EncodeContext<'_>,
        src: *const u8,
        stack: *mut RecursionStack,
    ) -> u32 {
        debug_assert_eq!(self.direction, Direction::Encode);
        let flags = ctx.flags;
        // SAFETY: forwarded from the caller; the context layout matches what
        // encode routines were generated against.
        unsafe { (self.func)(ctx as *mut EncodeContext<'_> as *mut u8, src as *mut u8, stack, flags) }
    }

    /// Run a decode routine into `dst`.
    ///
    /// # Safety
    /// `dst` must point to an initialized value of this routine's shape that
    /// nothing else references, and the routine must decode.
    pub(crate) unsafe fn run_decode(
        &self,
        ctx: &mut DecodeContext<'_>,
        dst: *mut u8,
        stack: *mut RecursionStack,
    ) -> u32 {
        debug_assert_eq!(self.direction, Direction::Decode);
        let flags = ctx.flags;
        // SAFETY: see `run_encode`.
        unsafe { (self.func)(ctx as *mut DecodeContext<'_> as *mut u8, dst, stack, flags) }
    }
}

impl fmt::Debug for CompiledRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRoutine")
            .field("shape", &self.shape.type_identifier)
            .field("direction", &self.direction)
            .field("instrs", &self.instrs)
            .field("bytes", &self.code().len())
            .finish()
    }
}

// SAFETY: the routine is immutable machine code plus shared tables; it
// carries no per-call state and may run on many threads at once.
unsafe impl Send for CompiledRoutine {}
unsafe impl Sync for CompiledRoutine {}

#[cfg(all(test, any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::ir::{Opcode, Operand, ProgramBuilder};
    use crate::shape::{Facet, IntKind};
    use crate::{Config, Engine};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn routines_are_shareable() {
        assert_send_sync::<CompiledRoutine>();
        assert_send_sync::<Arc<CompiledRoutine>>();
    }

    #[test]
    fn hand_built_program_runs() {
        let engine = Engine::new(Config::default());
        let mut b = ProgramBuilder::new(Direction::Encode, u32::SHAPE);
        b.text(b"[");
        b.push(Opcode::EmitInt, Operand::Int(IntKind::U32));
        b.text(b"]");
        let routine = CompiledRoutine::from_program(&b.finish(), engine.pool()).unwrap();
        assert_eq!(routine.direction(), Direction::Encode);
        assert!(!routine.code().is_empty());

        let value = 4096u32;
        let mut ctx = EncodeContext::new(&engine, Options::empty()).unwrap();
        let mut stack = RecursionStack::new(4, 16);
        let code = unsafe { routine.run_encode(&mut ctx, &value as *const u32 as *const u8, &mut stack) };
        assert_eq!(code, 0);
        assert_eq!(ctx.written(), b"[4096]");
    }

    #[test]
    fn decode_routine_reports_syntax_errors() {
        let engine = Engine::new(Config::default());
        let routine = CompiledRoutine::compile(u32::SHAPE, Direction::Decode, engine.config(), engine.pool()).unwrap();

        let mut out = 0u32;
        let mut ctx = DecodeContext::new(&engine, b"  17 ", Options::empty());
        let mut stack = RecursionStack::new(4, 16);
        let code = unsafe { routine.run_decode(&mut ctx, &mut out as *mut u32 as *mut u8, &mut stack) };
        assert_eq!(code, 0);
        assert_eq!(out, 17);

        let mut ctx = DecodeContext::new(&engine, b"[1]", Options::empty());
        let mut stack = RecursionStack::new(4, 16);
        unsafe { routine.run_decode(&mut ctx, &mut out as *mut u32 as *mut u8, &mut stack) };
        assert!(ctx.mismatch.is_some() || ctx.has_error());
        assert_eq!(out, 17);
    }
}
