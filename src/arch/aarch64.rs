use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler, dynasm};

use super::{Arg, FrameLayout, Loc, Role, RoleTable, SlotAlloc};
use crate::context::{CTX_ERROR_CODE, CTX_FLAGS, DEC_INPUT_END, DEC_INPUT_PTR, ENC_BUF_CAP, ENC_BUF_LEN, ENC_BUF_PTR};
use crate::error::CompileError;
use crate::intrinsics;
use crate::ir::Direction;
use crate::stack::{FRAME_SHIFT, STACK_CAP, STACK_FRAMES, STACK_TOP};

macro_rules! asm {
    ($ops:expr; $($t:tt)*) => {
        dynasm!($ops ; .arch aarch64 ; $($t)*)
    };
}

const X19: u8 = 19;
const X20: u8 = 20;
const X21: u8 = 21;
const X22: u8 = 22;
const X23: u8 = 23;
const X24: u8 = 24;
const X25: u8 = 25;
const X26: u8 = 26;
const X27: u8 = 27;
const X28: u8 = 28;

const TRUE: u32 = u32::from_le_bytes(*b"true");
const FALS: u32 = u32::from_le_bytes(*b"fals");
const NULL: u32 = u32::from_le_bytes(*b"null");

// AAPCS64. x29/x30 and x19-x28 take a 96-byte save area; every role
// gets a callee-saved register:
//   x19 = ctx
//   x20 = buf (encode) / cursor (decode)
//   x21 = len (encode) / end (decode)
//   x22 = cap (encode)
//   x23 = data pointer P
//   x24 = container cursor C
//   x25 = L, x26 = E, x27 = recursion stack, x28 = R
//   [sp, #0] = scratch words
//
// Temporaries: x8 (call target), x9-x13. Arguments: x0-x3.
fn role_table(direction: Direction, layout: FrameLayout) -> Result<(RoleTable, u32), CompileError> {
    let mut entries = vec![
        (Role::Ctx, Loc::Reg(X19)),
        (Role::Data, Loc::Reg(X23)),
        (Role::Iter, Loc::Reg(X24)),
        (Role::Stack, Loc::Reg(X27)),
    ];
    match direction {
        Direction::Encode => entries.extend([
            (Role::Buf, Loc::Reg(X20)),
            (Role::Len, Loc::Reg(X21)),
            (Role::Cap, Loc::Reg(X22)),
        ]),
        Direction::Decode => entries.extend([(Role::Cursor, Loc::Reg(X20)), (Role::End, Loc::Reg(X21))]),
    }
    if layout.loop_state {
        entries.push((Role::Count, Loc::Reg(X25)));
        entries.push((Role::Elem, Loc::Reg(X26)));
    }
    if layout.result {
        entries.push((Role::Result, Loc::Reg(X28)));
    }
    let mut slots = SlotAlloc::new();
    if layout.scratch {
        entries.push((Role::Scratch, slots.take(16)));
    }
    let frame = (slots.used() + 15) & !15;
    Ok((RoleTable::new(entries)?, frame))
}

pub struct EmitCtx {
    ops: VecAssembler<Aarch64Relocation>,
    direction: Direction,
    roles: RoleTable,
    frame: u32,
    error_exit: DynamicLabel,
    ctx: u8,
    data: u8,
    iter: u8,
    /// buf or cursor
    a: u8,
    /// len or end
    b: u8,
    /// cap; only meaningful when encoding
    cap: u8,
    fault: Option<CompileError>,
}

impl EmitCtx {
    pub fn new(direction: Direction, layout: FrameLayout) -> Result<Self, CompileError> {
        let (roles, frame) = role_table(direction, layout)?;
        let (a, b, cap) = match direction {
            Direction::Encode => (roles.reg(Role::Buf)?, roles.reg(Role::Len)?, roles.reg(Role::Cap)?),
            Direction::Decode => {
                let end = roles.reg(Role::End)?;
                (roles.reg(Role::Cursor)?, end, end)
            }
        };
        let mut ops = VecAssembler::new(0);
        let error_exit = ops.new_dynamic_label();
        Ok(EmitCtx {
            ctx: roles.reg(Role::Ctx)?,
            data: roles.reg(Role::Data)?,
            iter: roles.reg(Role::Iter)?,
            a,
            b,
            cap,
            ops,
            direction,
            roles,
            frame,
            error_exit,
            fault: None,
        })
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    pub fn frame_size(&self) -> u32 {
        self.frame
    }

    pub fn offset(&self) -> usize {
        self.ops.offset().0
    }

    pub fn new_label(&mut self) -> DynamicLabel {
        self.ops.new_dynamic_label()
    }

    pub fn bind(&mut self, label: DynamicLabel) {
        asm!(self.ops ; =>label);
    }

    pub fn jump(&mut self, label: DynamicLabel) {
        asm!(self.ops ; b =>label);
    }

    fn missing(&mut self, role: Role) {
        if self.fault.is_none() {
            self.fault = Some(CompileError::Assembly(format!(
                "role {} has no location in this frame",
                role.name()
            )));
        }
    }

    fn load(&mut self, dst: u8, role: Role) {
        match self.roles.get(role) {
            Some(Loc::Reg(r)) => asm!(self.ops ; mov X(dst), X(r)),
            Some(Loc::Slot { off, .. }) => asm!(self.ops ; ldr X(dst), [sp, #off]),
            None => self.missing(role),
        }
    }

    fn store(&mut self, src: u8, role: Role) {
        match self.roles.get(role) {
            Some(Loc::Reg(r)) => asm!(self.ops ; mov X(r), X(src)),
            Some(Loc::Slot { off, .. }) => asm!(self.ops ; str X(src), [sp, #off]),
            None => self.missing(role),
        }
    }

    fn slot(&mut self, role: Role) -> u32 {
        match self.roles.get(role) {
            Some(Loc::Slot { off, .. }) => off,
            _ => {
                self.missing(role);
                0
            }
        }
    }

    /// Materialize a 64-bit constant.
    fn mov_imm(&mut self, dst: u8, v: u64) {
        asm!(self.ops
            ; movz X(dst), #(v & 0xFFFF) as u32
            ; movk X(dst), #((v >> 16) & 0xFFFF) as u32, LSL #16
            ; movk X(dst), #((v >> 32) & 0xFFFF) as u32, LSL #32
            ; movk X(dst), #((v >> 48) & 0xFFFF) as u32, LSL #48
        );
    }

    fn mov_imm32(&mut self, dst: u8, v: u32) {
        let (lo, hi) = (v & 0xFFFF, v >> 16);
        asm!(self.ops
            ; movz W(dst), #lo
            ; movk W(dst), #hi, LSL #16
        );
    }

    pub fn prologue(&mut self) {
        let (ctx, data, a, b, cap) = (self.ctx, self.data, self.a, self.b, self.cap);
        let frame = self.frame;
        asm!(self.ops
            ; stp x29, x30, [sp, #-96]!
            ; mov x29, sp
            ; stp x19, x20, [sp, #16]
            ; stp x21, x22, [sp, #32]
            ; stp x23, x24, [sp, #48]
            ; stp x25, x26, [sp, #64]
            ; stp x27, x28, [sp, #80]
        );
        if frame > 0 {
            asm!(self.ops ; sub sp, sp, #frame);
        }
        asm!(self.ops
            ; mov X(ctx), x0
            ; mov X(data), x1
            ; str x3, [X(ctx), #CTX_FLAGS]
        );
        self.store(2, Role::Stack);
        match self.direction {
            Direction::Encode => asm!(self.ops
                ; ldr X(a), [X(ctx), #ENC_BUF_PTR]
                ; ldr X(b), [X(ctx), #ENC_BUF_LEN]
                ; ldr X(cap), [X(ctx), #ENC_BUF_CAP]
            ),
            Direction::Decode => asm!(self.ops
                ; ldr X(a), [X(ctx), #DEC_INPUT_PTR]
                ; ldr X(b), [X(ctx), #DEC_INPUT_END]
            ),
        }
    }

    /// Shared exit for success and failure. Returns the error code in w0.
    pub fn epilogue(&mut self) {
        let error_exit = self.error_exit;
        let ctx = self.ctx;
        let frame = self.frame;
        asm!(self.ops ; =>error_exit);
        self.flush();
        // Pointers left in the frame must not outlive the call.
        if let Some(Loc::Slot { off, .. }) = self.roles.get(Role::Scratch) {
            asm!(self.ops ; stp xzr, xzr, [sp, #off]);
        }
        asm!(self.ops ; ldr w0, [X(ctx), #CTX_ERROR_CODE]);
        if frame > 0 {
            asm!(self.ops ; add sp, sp, #frame);
        }
        asm!(self.ops
            ; ldp x27, x28, [sp, #80]
            ; ldp x25, x26, [sp, #64]
            ; ldp x23, x24, [sp, #48]
            ; ldp x21, x22, [sp, #32]
            ; ldp x19, x20, [sp, #16]
            ; ldp x29, x30, [sp], #96
            ; ret
        );
    }

    pub fn finish(self) -> Result<Vec<u8>, CompileError> {
        if let Some(fault) = self.fault {
            return Err(fault);
        }
        self.ops.finalize().map_err(|e| CompileError::Assembly(e.to_string()))
    }

    // --- call-out protocol ---

    fn flush(&mut self) {
        let (ctx, a, b) = (self.ctx, self.a, self.b);
        match self.direction {
            Direction::Encode => asm!(self.ops ; str X(b), [X(ctx), #ENC_BUF_LEN]),
            Direction::Decode => asm!(self.ops ; str X(a), [X(ctx), #DEC_INPUT_PTR]),
        }
    }

    fn reload(&mut self) {
        let (ctx, a, b, cap) = (self.ctx, self.a, self.b, self.cap);
        match self.direction {
            Direction::Encode => asm!(self.ops
                ; ldr X(a), [X(ctx), #ENC_BUF_PTR]
                ; ldr X(b), [X(ctx), #ENC_BUF_LEN]
                ; ldr X(cap), [X(ctx), #ENC_BUF_CAP]
            ),
            Direction::Decode => asm!(self.ops ; ldr X(a), [X(ctx), #DEC_INPUT_PTR]),
        }
    }

    fn load_args(&mut self, args: &[Arg]) {
        if args.len() > 4 {
            self.fault = Some(CompileError::Assembly(format!("{} call arguments", args.len())));
            return;
        }
        let (ctx, data, iter) = (self.ctx, self.data, self.iter);
        for (dst, &arg) in args.iter().enumerate() {
            let dst = dst as u8;
            match arg {
                Arg::Ctx => asm!(self.ops ; mov X(dst), X(ctx)),
                Arg::ErrorSlot => asm!(self.ops ; add X(dst), X(ctx), #CTX_ERROR_CODE),
                Arg::Data => asm!(self.ops ; mov X(dst), X(data)),
                Arg::Iter => asm!(self.ops ; mov X(dst), X(iter)),
                Arg::Stack => self.load(dst, Role::Stack),
                Arg::Scratch => {
                    let off = self.slot(Role::Scratch);
                    asm!(self.ops ; add X(dst), sp, #off);
                }
                Arg::Imm(v) => self.mov_imm(dst, v),
            }
        }
    }

    /// Same protocol as the x86-64 backend: flush, call through x8, reload,
    /// then test the error slot. The return value stays in x0.
    pub fn call(&mut self, f: *const u8, args: &[Arg]) {
        let error_exit = self.error_exit;
        let ctx = self.ctx;
        self.flush();
        self.load_args(args);
        self.mov_imm(8, f as u64);
        asm!(self.ops ; blr x8);
        self.reload();
        asm!(self.ops
            ; ldr w9, [X(ctx), #CTX_ERROR_CODE]
            ; cbnz w9, =>error_exit
        );
    }

    pub fn call_pure(&mut self, f: *const u8, args: &[Arg]) {
        self.load_args(args);
        self.mov_imm(8, f as u64);
        asm!(self.ops ; blr x8);
    }

    pub fn data_from_ret(&mut self) {
        let data = self.data;
        asm!(self.ops ; mov X(data), x0);
    }

    pub fn iter_from_ret(&mut self) {
        let iter = self.iter;
        asm!(self.ops ; mov X(iter), x0);
    }

    pub fn result_from_ret(&mut self) {
        self.store(0, Role::Result);
    }

    pub fn branch_ret_zero(&mut self, label: DynamicLabel) {
        asm!(self.ops ; cbz x0, =>label);
    }

    pub fn branch_ret_nonzero(&mut self, label: DynamicLabel) {
        asm!(self.ops ; cbnz x0, =>label);
    }

    // --- data pointer and loops ---

    pub fn index(&mut self, offset: usize) {
        let data = self.data;
        if offset < 4096 {
            let offset = offset as u32;
            asm!(self.ops ; add X(data), X(data), #offset);
        } else {
            self.mov_imm(9, offset as u64);
            asm!(self.ops ; add X(data), X(data), x9);
        }
    }

    pub fn deref(&mut self) {
        let data = self.data;
        asm!(self.ops ; ldr X(data), [X(data)]);
    }

    pub fn array_begin(&mut self, len: usize, elem_size: usize) {
        let (data, iter) = (self.data, self.iter);
        asm!(self.ops ; mov X(iter), X(data));
        self.mov_imm(9, len as u64);
        self.store(9, Role::Count);
        self.set_elem(elem_size);
    }

    pub fn set_elem(&mut self, elem_size: usize) {
        self.mov_imm(9, elem_size as u64);
        self.store(9, Role::Elem);
    }

    pub fn view_from_scratch(&mut self) {
        let iter = self.iter;
        let off = self.slot(Role::Scratch);
        asm!(self.ops ; ldp X(iter), x9, [sp, #off]);
        self.store(9, Role::Count);
    }

    pub fn seq_next(&mut self, done: DynamicLabel) {
        let (data, iter) = (self.data, self.iter);
        self.load(9, Role::Count);
        asm!(self.ops
            ; cbz x9, =>done
            ; sub x9, x9, #1
        );
        self.store(9, Role::Count);
        asm!(self.ops ; mov X(data), X(iter));
        self.load(10, Role::Elem);
        asm!(self.ops ; add X(iter), X(iter), x10);
    }

    pub fn switch(&mut self, targets: &[DynamicLabel]) {
        self.load(9, Role::Result);
        for (i, &target) in targets.iter().enumerate() {
            if i < 4096 {
                let i = i as u32;
                asm!(self.ops ; cmp x9, #i);
            } else {
                self.mov_imm(10, i as u64);
                asm!(self.ops ; cmp x9, x10);
            }
            asm!(self.ops ; b.eq =>target);
        }
    }

    // --- recursion stack ---

    pub fn save_frame(&mut self) {
        let (data, iter) = (self.data, self.iter);
        let ok = self.new_label();
        self.load(9, Role::Stack);
        asm!(self.ops
            ; ldr x10, [x9, #STACK_TOP]
            ; ldr x11, [x9, #STACK_CAP]
            ; cmp x10, x11
            ; b.lo =>ok
        );
        self.call(
            crate::stack::jitson_stack_grow as *const u8,
            &[Arg::Stack, Arg::ErrorSlot],
        );
        self.bind(ok);
        self.load(9, Role::Stack);
        asm!(self.ops
            ; ldr x10, [x9, #STACK_TOP]
            ; ldr x11, [x9, #STACK_FRAMES]
            ; add x11, x11, x10, LSL #FRAME_SHIFT
            ; stp X(data), X(iter), [x11]
        );
        self.load(12, Role::Count);
        self.load(13, Role::Elem);
        asm!(self.ops
            ; stp x12, x13, [x11, #16]
            ; add x10, x10, #1
            ; str x10, [x9, #STACK_TOP]
        );
    }

    pub fn load_frame(&mut self) {
        let (data, iter) = (self.data, self.iter);
        self.load(9, Role::Stack);
        asm!(self.ops
            ; ldr x10, [x9, #STACK_TOP]
            ; ldr x11, [x9, #STACK_FRAMES]
            ; add x11, x11, x10, LSL #FRAME_SHIFT
            ; sub x11, x11, #32
            ; ldp X(data), X(iter), [x11]
            ; ldp x12, x13, [x11, #16]
        );
        self.store(12, Role::Count);
        self.store(13, Role::Elem);
    }

    pub fn drop_frame(&mut self) {
        self.load(9, Role::Stack);
        asm!(self.ops
            ; ldr x10, [x9, #STACK_TOP]
            ; sub x10, x10, #1
            ; str x10, [x9, #STACK_TOP]
        );
    }

    // --- encode ---

    pub fn ensure(&mut self, n: u32) {
        let (len, cap) = (self.b, self.cap);
        let ok = self.new_label();
        asm!(self.ops ; sub x9, X(cap), X(len));
        if n < 4096 {
            asm!(self.ops ; cmp x9, #n);
        } else {
            self.mov_imm(10, n as u64);
            asm!(self.ops ; cmp x9, x10);
        }
        asm!(self.ops ; b.hs =>ok);
        self.call(
            intrinsics::jitson_buf_grow as *const u8,
            &[Arg::Ctx, Arg::Imm(n as u64)],
        );
        self.bind(ok);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let (buf, len) = (self.a, self.b);
        asm!(self.ops ; add x10, X(buf), X(len));
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.mov_imm(9, u64::from_le_bytes(word));
            asm!(self.ops ; str x9, [x10], #8);
        }
        let mut rest = chunks.remainder();
        if rest.len() >= 4 {
            self.mov_imm32(9, u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]));
            asm!(self.ops ; str w9, [x10], #4);
            rest = &rest[4..];
        }
        for &byte in rest {
            let byte = byte as u32;
            asm!(self.ops
                ; movz w9, #byte
                ; strb w9, [x10], #1
            );
        }
        let n = bytes.len();
        if n < 4096 {
            let n = n as u32;
            asm!(self.ops ; add X(len), X(len), #n);
        } else {
            self.mov_imm(9, n as u64);
            asm!(self.ops ; add X(len), X(len), x9);
        }
    }

    pub fn comma_unless_open(&mut self) {
        let (buf, len) = (self.a, self.b);
        self.ensure(1);
        let skip = self.new_label();
        asm!(self.ops
            ; cbz X(len), =>skip
            ; sub x11, X(len), #1
            ; ldrb w9, [X(buf), x11]
            ; cmp w9, #0x7b
            ; b.eq =>skip
            ; cmp w9, #0x5b
            ; b.eq =>skip
            ; movz w9, #0x2c
            ; strb w9, [X(buf), X(len)]
            ; add X(len), X(len), #1
            ; =>skip
        );
    }

    pub fn emit_bool(&mut self) {
        let (buf, len, data) = (self.a, self.b, self.data);
        self.ensure(5);
        let is_false = self.new_label();
        let done = self.new_label();
        asm!(self.ops
            ; ldrb w11, [X(data)]
            ; add x10, X(buf), X(len)
            ; cbz w11, =>is_false
        );
        self.mov_imm32(9, TRUE);
        asm!(self.ops
            ; str w9, [x10]
            ; add X(len), X(len), #4
            ; b =>done
            ; =>is_false
        );
        self.mov_imm32(9, FALS);
        asm!(self.ops
            ; str w9, [x10]
            ; movz w9, #0x65
            ; strb w9, [x10, #4]
            ; add X(len), X(len), #5
            ; =>done
        );
    }

    pub fn branch_if_zero(&mut self, width: u8, target: DynamicLabel) {
        let data = self.data;
        match width {
            1 => asm!(self.ops ; ldrb w9, [X(data)] ; cbz w9, =>target),
            2 => asm!(self.ops ; ldrh w9, [X(data)] ; cbz w9, =>target),
            4 => asm!(self.ops ; ldr w9, [X(data)] ; cbz w9, =>target),
            _ => asm!(self.ops ; ldr x9, [X(data)] ; cbz x9, =>target),
        }
    }

    // --- decode ---

    pub fn skip_ws(&mut self) {
        let (cur, end) = (self.a, self.b);
        let top = self.new_label();
        let advance = self.new_label();
        let done = self.new_label();
        asm!(self.ops
            ; =>top
            ; cmp X(cur), X(end)
            ; b.hs =>done
            ; ldrb w9, [X(cur)]
            ; cmp w9, #0x20
            ; b.eq =>advance
            ; b.hi =>done
            ; cmp w9, #0x0a
            ; b.eq =>advance
            ; cmp w9, #0x0d
            ; b.eq =>advance
            ; cmp w9, #0x09
            ; b.ne =>done
            ; =>advance
            ; add X(cur), X(cur), #1
            ; b =>top
            ; =>done
        );
    }

    fn peek_is(&mut self, byte: u8, miss: DynamicLabel) {
        let (cur, end) = (self.a, self.b);
        let byte = byte as u32;
        asm!(self.ops
            ; cmp X(cur), X(end)
            ; b.hs =>miss
            ; ldrb w9, [X(cur)]
            ; cmp w9, #byte
            ; b.ne =>miss
        );
    }

    fn consume(&mut self, n: u32) {
        let cur = self.a;
        asm!(self.ops ; add X(cur), X(cur), #n);
    }

    pub fn branch_if_byte(&mut self, byte: u8, target: DynamicLabel) {
        self.skip_ws();
        let miss = self.new_label();
        self.peek_is(byte, miss);
        self.consume(1);
        self.jump(target);
        self.bind(miss);
    }

    pub fn expect_byte(&mut self, byte: u8) {
        self.skip_ws();
        let miss = self.new_label();
        let ok = self.new_label();
        self.peek_is(byte, miss);
        self.consume(1);
        self.jump(ok);
        self.bind(miss);
        self.call(
            intrinsics::jitson_expect_failed as *const u8,
            &[Arg::Ctx, Arg::Imm(byte as u64)],
        );
        self.bind(ok);
    }

    pub fn branch_if_null(&mut self, target: DynamicLabel) {
        let (cur, end) = (self.a, self.b);
        self.skip_ws();
        let miss = self.new_label();
        asm!(self.ops
            ; sub x9, X(end), X(cur)
            ; cmp x9, #4
            ; b.lo =>miss
            ; ldr w9, [X(cur)]
        );
        self.mov_imm32(10, NULL);
        asm!(self.ops
            ; cmp w9, w10
            ; b.ne =>miss
            ; add X(cur), X(cur), #4
            ; b =>target
            ; =>miss
        );
    }

    pub fn open_or_skip(&mut self, byte: u8, shape: *const u8, target: DynamicLabel) {
        self.skip_ws();
        let miss = self.new_label();
        let ok = self.new_label();
        self.peek_is(byte, miss);
        self.consume(1);
        self.jump(ok);
        self.bind(miss);
        self.call(
            intrinsics::jitson_mismatch_skip as *const u8,
            &[Arg::Ctx, Arg::Imm(shape as u64)],
        );
        self.jump(target);
        self.bind(ok);
    }

    pub fn comma_or_end(&mut self, close: u8, target: DynamicLabel) {
        self.skip_ws();
        let not_comma = self.new_label();
        let miss = self.new_label();
        let next = self.new_label();
        self.peek_is(b',', not_comma);
        self.consume(1);
        self.jump(next);
        self.bind(not_comma);
        self.peek_is(close, miss);
        self.consume(1);
        self.jump(target);
        self.bind(miss);
        self.call(
            intrinsics::jitson_expect_failed as *const u8,
            &[Arg::Ctx, Arg::Imm(close as u64)],
        );
        self.bind(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_frame_is_sixteen_aligned() {
        let layout = FrameLayout {
            loop_state: true,
            result: true,
            scratch: true,
        };
        let (roles, frame) = role_table(Direction::Encode, layout).unwrap();
        assert_eq!(frame % 16, 0);
        assert_eq!(roles.get(Role::Count), Some(Loc::Reg(X25)));
        let (_, frame) = role_table(Direction::Decode, FrameLayout::default()).unwrap();
        assert_eq!(frame, 0);
    }
}
