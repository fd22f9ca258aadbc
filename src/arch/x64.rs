use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler, dynasm};

use super::{Arg, FrameLayout, Loc, Role, RoleTable, SlotAlloc};
use crate::context::{CTX_ERROR_CODE, CTX_FLAGS, DEC_INPUT_END, DEC_INPUT_PTR, ENC_BUF_CAP, ENC_BUF_LEN, ENC_BUF_PTR};
use crate::error::CompileError;
use crate::intrinsics;
use crate::ir::Direction;
use crate::stack::{FRAME_SHIFT, STACK_CAP, STACK_FRAMES, STACK_TOP};

macro_rules! asm {
    ($ops:expr; $($t:tt)*) => {
        dynasm!($ops ; .arch x64 ; $($t)*)
    };
}

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R10: u8 = 10;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

const ARG_REGS: [u8; 4] = [RDI, RSI, RDX, RCX];

const TRUE: i32 = i32::from_le_bytes(*b"true");
const FALS: i32 = i32::from_le_bytes(*b"fals");
const NULL: i32 = i32::from_le_bytes(*b"null");

// System V AMD64, every role in a callee-saved register or a stack slot:
//   r15 = ctx
//   r12 = buf (encode) / cursor (decode)
//   r13 = len (encode) / end (decode)
//   r14 = cap (encode)
//   rbx = data pointer P
//   rbp = container cursor C
//   [rsp+..] = recursion stack pointer, L, E, R, scratch
//
// Scratch: rax, r10, r11. Arguments: rdi, rsi, rdx, rcx.
fn role_table(direction: Direction, layout: FrameLayout) -> Result<(RoleTable, u32), CompileError> {
    let mut entries = vec![
        (Role::Ctx, Loc::Reg(R15)),
        (Role::Data, Loc::Reg(RBX)),
        (Role::Iter, Loc::Reg(RBP)),
    ];
    match direction {
        Direction::Encode => entries.extend([
            (Role::Buf, Loc::Reg(R12)),
            (Role::Len, Loc::Reg(R13)),
            (Role::Cap, Loc::Reg(R14)),
        ]),
        Direction::Decode => entries.extend([(Role::Cursor, Loc::Reg(R12)), (Role::End, Loc::Reg(R13))]),
    }

    let mut slots = SlotAlloc::new();
    entries.push((Role::Stack, slots.take(8)));
    if layout.loop_state {
        entries.push((Role::Count, slots.take(8)));
        entries.push((Role::Elem, slots.take(8)));
    }
    if layout.result {
        entries.push((Role::Result, slots.take(8)));
    }
    if layout.scratch {
        entries.push((Role::Scratch, slots.take(16)));
    }

    // Six pushes plus the return address leave rsp 8 bytes off alignment.
    let used = slots.used();
    let frame = if used % 16 == 0 { used + 8 } else { used };
    Ok((RoleTable::new(entries)?, frame))
}

pub struct EmitCtx {
    ops: VecAssembler<X64Relocation>,
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
        asm!(self.ops ; jmp =>label);
    }

    fn missing(&mut self, role: Role) {
        if self.fault.is_none() {
            self.fault = Some(CompileError::Assembly(format!(
                "role {} has no location in this frame",
                role.name()
            )));
        }
    }

    /// `dst = role`
    fn load(&mut self, dst: u8, role: Role) {
        match self.roles.get(role) {
            Some(Loc::Reg(r)) => asm!(self.ops ; mov Rq(dst), Rq(r)),
            Some(Loc::Slot { off, .. }) => asm!(self.ops ; mov Rq(dst), QWORD [rsp + off as i32]),
            None => self.missing(role),
        }
    }

    /// `role = src`
    fn store(&mut self, src: u8, role: Role) {
        match self.roles.get(role) {
            Some(Loc::Reg(r)) => asm!(self.ops ; mov Rq(r), Rq(src)),
            Some(Loc::Slot { off, .. }) => asm!(self.ops ; mov QWORD [rsp + off as i32], Rq(src)),
            None => self.missing(role),
        }
    }

    fn slot(&mut self, role: Role) -> i32 {
        match self.roles.get(role) {
            Some(Loc::Slot { off, .. }) => off as i32,
            _ => {
                self.missing(role);
                0
            }
        }
    }

    pub fn prologue(&mut self) {
        let (ctx, data, a, b, cap) = (self.ctx, self.data, self.a, self.b, self.cap);
        asm!(self.ops
            ; push rbp
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, self.frame as i32
            ; mov Rq(ctx), rdi
            ; mov Rq(data), rsi
            ; mov QWORD [Rq(ctx) + CTX_FLAGS as i32], rcx
        );
        self.store(RDX, Role::Stack);
        match self.direction {
            Direction::Encode => asm!(self.ops
                ; mov Rq(a), QWORD [Rq(ctx) + ENC_BUF_PTR as i32]
                ; mov Rq(b), QWORD [Rq(ctx) + ENC_BUF_LEN as i32]
                ; mov Rq(cap), QWORD [Rq(ctx) + ENC_BUF_CAP as i32]
            ),
            Direction::Decode => asm!(self.ops
                ; mov Rq(a), QWORD [Rq(ctx) + DEC_INPUT_PTR as i32]
                ; mov Rq(b), QWORD [Rq(ctx) + DEC_INPUT_END as i32]
            ),
        }
    }

    /// Shared exit for success and failure. Returns the error code in eax.
    pub fn epilogue(&mut self) {
        let error_exit = self.error_exit;
        let ctx = self.ctx;
        asm!(self.ops ; =>error_exit);
        self.flush();
        // Pointers left in the frame must not outlive the call.
        if let Some(Loc::Slot { off, .. }) = self.roles.get(Role::Stack) {
            asm!(self.ops ; mov QWORD [rsp + off as i32], 0);
        }
        if let Some(Loc::Slot { off, .. }) = self.roles.get(Role::Scratch) {
            asm!(self.ops
                ; mov QWORD [rsp + off as i32], 0
                ; mov QWORD [rsp + off as i32 + 8], 0
            );
        }
        asm!(self.ops
            ; mov eax, DWORD [Rq(ctx) + CTX_ERROR_CODE as i32]
            ; add rsp, self.frame as i32
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
            ; pop rbp
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

    /// Write the cached cursor or length back to the context.
    fn flush(&mut self) {
        let (ctx, a, b) = (self.ctx, self.a, self.b);
        match self.direction {
            Direction::Encode => asm!(self.ops ; mov QWORD [Rq(ctx) + ENC_BUF_LEN as i32], Rq(b)),
            Direction::Decode => asm!(self.ops ; mov QWORD [Rq(ctx) + DEC_INPUT_PTR as i32], Rq(a)),
        }
    }

    /// Runtime support may have grown the buffer or moved the cursor.
    fn reload(&mut self) {
        let (ctx, a, b, cap) = (self.ctx, self.a, self.b, self.cap);
        match self.direction {
            Direction::Encode => asm!(self.ops
                ; mov Rq(a), QWORD [Rq(ctx) + ENC_BUF_PTR as i32]
                ; mov Rq(b), QWORD [Rq(ctx) + ENC_BUF_LEN as i32]
                ; mov Rq(cap), QWORD [Rq(ctx) + ENC_BUF_CAP as i32]
            ),
            Direction::Decode => asm!(self.ops ; mov Rq(a), QWORD [Rq(ctx) + DEC_INPUT_PTR as i32]),
        }
    }

    fn load_args(&mut self, args: &[Arg]) {
        if args.len() > ARG_REGS.len() {
            self.fault = Some(CompileError::Assembly(format!("{} call arguments", args.len())));
            return;
        }
        let (ctx, data, iter) = (self.ctx, self.data, self.iter);
        for (&arg, &dst) in args.iter().zip(ARG_REGS.iter()) {
            match arg {
                Arg::Ctx => asm!(self.ops ; mov Rq(dst), Rq(ctx)),
                Arg::ErrorSlot => asm!(self.ops ; lea Rq(dst), [Rq(ctx) + CTX_ERROR_CODE as i32]),
                Arg::Data => asm!(self.ops ; mov Rq(dst), Rq(data)),
                Arg::Iter => asm!(self.ops ; mov Rq(dst), Rq(iter)),
                Arg::Stack => self.load(dst, Role::Stack),
                Arg::Scratch => {
                    let off = self.slot(Role::Scratch);
                    asm!(self.ops ; lea Rq(dst), [rsp + off]);
                }
                Arg::Imm(v) => {
                    let v = v as i64;
                    asm!(self.ops ; mov Rq(dst), QWORD v);
                }
            }
        }
    }

    /// Call runtime support: flush the cached cursor, call, reload, and
    /// leave through the error exit if the error slot was set. The return
    /// value stays in rax.
    ///
    /// Every role lives in a callee-saved register or in the frame, so only
    /// the cursor (or buffer triple) needs to round-trip through the context.
    pub fn call(&mut self, f: *const u8, args: &[Arg]) {
        let error_exit = self.error_exit;
        let ctx = self.ctx;
        let f = f as i64;
        self.flush();
        self.load_args(args);
        asm!(self.ops
            ; mov rax, QWORD f
            ; call rax
        );
        self.reload();
        asm!(self.ops
            ; mov r10d, DWORD [Rq(ctx) + CTX_ERROR_CODE as i32]
            ; test r10d, r10d
            ; jnz =>error_exit
        );
    }

    /// Call a function that touches neither the context nor the error slot.
    pub fn call_pure(&mut self, f: *const u8, args: &[Arg]) {
        let f = f as i64;
        self.load_args(args);
        asm!(self.ops
            ; mov rax, QWORD f
            ; call rax
        );
    }

    pub fn data_from_ret(&mut self) {
        let data = self.data;
        asm!(self.ops ; mov Rq(data), rax);
    }

    pub fn iter_from_ret(&mut self) {
        let iter = self.iter;
        asm!(self.ops ; mov Rq(iter), rax);
    }

    pub fn result_from_ret(&mut self) {
        self.store(RAX, Role::Result);
    }

    pub fn branch_ret_zero(&mut self, label: DynamicLabel) {
        asm!(self.ops
            ; test rax, rax
            ; jz =>label
        );
    }

    pub fn branch_ret_nonzero(&mut self, label: DynamicLabel) {
        asm!(self.ops
            ; test rax, rax
            ; jnz =>label
        );
    }

    // --- data pointer and loops ---

    pub fn index(&mut self, offset: usize) {
        let data = self.data;
        match i32::try_from(offset) {
            Ok(off) => asm!(self.ops ; add Rq(data), off),
            Err(_) => {
                let offset = offset as i64;
                asm!(self.ops
                    ; mov rax, QWORD offset
                    ; add Rq(data), rax
                );
            }
        }
    }

    pub fn deref(&mut self) {
        let data = self.data;
        asm!(self.ops ; mov Rq(data), QWORD [Rq(data)]);
    }

    pub fn array_begin(&mut self, len: usize, elem_size: usize) {
        let (data, iter) = (self.data, self.iter);
        let len = len as i64;
        asm!(self.ops
            ; mov Rq(iter), Rq(data)
            ; mov rax, QWORD len
        );
        self.store(RAX, Role::Count);
        self.set_elem(elem_size);
    }

    pub fn set_elem(&mut self, elem_size: usize) {
        let elem_size = elem_size as i64;
        asm!(self.ops ; mov rax, QWORD elem_size);
        self.store(RAX, Role::Elem);
    }

    /// `C = scratch[0]`, `L = scratch[1]`.
    pub fn view_from_scratch(&mut self) {
        let iter = self.iter;
        let off = self.slot(Role::Scratch);
        asm!(self.ops
            ; mov Rq(iter), QWORD [rsp + off]
            ; mov rax, QWORD [rsp + off + 8]
        );
        self.store(RAX, Role::Count);
    }

    pub fn seq_next(&mut self, done: DynamicLabel) {
        let (data, iter) = (self.data, self.iter);
        self.load(RAX, Role::Count);
        asm!(self.ops
            ; test rax, rax
            ; jz =>done
            ; sub rax, 1
        );
        self.store(RAX, Role::Count);
        asm!(self.ops ; mov Rq(data), Rq(iter));
        self.load(RAX, Role::Elem);
        asm!(self.ops ; add Rq(iter), rax);
    }

    pub fn switch(&mut self, targets: &[DynamicLabel]) {
        self.load(RAX, Role::Result);
        for (i, &target) in targets.iter().enumerate() {
            asm!(self.ops
                ; cmp rax, i as i32
                ; je =>target
            );
        }
    }

    // --- recursion stack ---

    pub fn save_frame(&mut self) {
        let (data, iter) = (self.data, self.iter);
        let ok = self.new_label();
        self.load(RAX, Role::Stack);
        asm!(self.ops
            ; mov r10, QWORD [rax + STACK_TOP as i32]
            ; cmp r10, QWORD [rax + STACK_CAP as i32]
            ; jb =>ok
        );
        self.call(
            crate::stack::jitson_stack_grow as *const u8,
            &[Arg::Stack, Arg::ErrorSlot],
        );
        self.bind(ok);
        self.load(RAX, Role::Stack);
        asm!(self.ops
            ; mov r10, QWORD [rax + STACK_TOP as i32]
            ; mov r11, QWORD [rax + STACK_FRAMES as i32]
            ; shl r10, FRAME_SHIFT as i8
            ; add r11, r10
            ; mov QWORD [r11], Rq(data)
            ; mov QWORD [r11 + 8], Rq(iter)
        );
        self.load(R10, Role::Count);
        asm!(self.ops ; mov QWORD [r11 + 16], r10);
        self.load(R10, Role::Elem);
        asm!(self.ops
            ; mov QWORD [r11 + 24], r10
            ; add QWORD [rax + STACK_TOP as i32], 1
        );
    }

    /// Restore every role from the top frame, leaving it in place.
    pub fn load_frame(&mut self) {
        let (data, iter) = (self.data, self.iter);
        self.load(RAX, Role::Stack);
        asm!(self.ops
            ; mov r10, QWORD [rax + STACK_TOP as i32]
            ; mov r11, QWORD [rax + STACK_FRAMES as i32]
            ; shl r10, FRAME_SHIFT as i8
            ; add r11, r10
            ; mov Rq(data), QWORD [r11 - 32]
            ; mov Rq(iter), QWORD [r11 - 24]
            ; mov r10, QWORD [r11 - 16]
        );
        self.store(R10, Role::Count);
        asm!(self.ops ; mov r10, QWORD [r11 - 8]);
        self.store(R10, Role::Elem);
    }

    pub fn drop_frame(&mut self) {
        self.load(RAX, Role::Stack);
        asm!(self.ops ; sub QWORD [rax + STACK_TOP as i32], 1);
    }

    // --- encode ---

    /// Make room for `n` more output bytes.
    pub fn ensure(&mut self, n: u32) {
        let (len, cap) = (self.b, self.cap);
        let ok = self.new_label();
        asm!(self.ops
            ; mov rax, Rq(cap)
            ; sub rax, Rq(len)
            ; cmp rax, n as i32
            ; jae =>ok
        );
        self.call(
            intrinsics::jitson_buf_grow as *const u8,
            &[Arg::Ctx, Arg::Imm(n as u64)],
        );
        self.bind(ok);
    }

    /// Store literal bytes at the end of the output. Room must already be ensured.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let (buf, len) = (self.a, self.b);
        let mut off = 0i32;
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            let word = i64::from_le_bytes(word);
            asm!(self.ops
                ; mov rax, QWORD word
                ; mov QWORD [Rq(buf) + Rq(len) + off], rax
            );
            off += 8;
        }
        let mut rest = chunks.remainder();
        if rest.len() >= 4 {
            let word = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
            asm!(self.ops ; mov DWORD [Rq(buf) + Rq(len) + off], word);
            off += 4;
            rest = &rest[4..];
        }
        for &byte in rest {
            asm!(self.ops ; mov BYTE [Rq(buf) + Rq(len) + off], byte as i8);
            off += 1;
        }
        asm!(self.ops ; add Rq(len), off);
    }

    pub fn comma_unless_open(&mut self) {
        let (buf, len) = (self.a, self.b);
        self.ensure(1);
        let skip = self.new_label();
        asm!(self.ops
            ; test Rq(len), Rq(len)
            ; jz =>skip
            ; movzx eax, BYTE [Rq(buf) + Rq(len) - 1]
            ; cmp eax, b'{' as i32
            ; je =>skip
            ; cmp eax, b'[' as i32
            ; je =>skip
            ; mov BYTE [Rq(buf) + Rq(len)], b',' as i8
            ; add Rq(len), 1
            ; =>skip
        );
    }

    pub fn emit_bool(&mut self) {
        let (buf, len, data) = (self.a, self.b, self.data);
        self.ensure(5);
        let is_false = self.new_label();
        let done = self.new_label();
        asm!(self.ops
            ; cmp BYTE [Rq(data)], 0
            ; je =>is_false
            ; mov DWORD [Rq(buf) + Rq(len)], TRUE
            ; add Rq(len), 4
            ; jmp =>done
            ; =>is_false
            ; mov DWORD [Rq(buf) + Rq(len)], FALS
            ; mov BYTE [Rq(buf) + Rq(len) + 4], b'e' as i8
            ; add Rq(len), 5
            ; =>done
        );
    }

    pub fn branch_if_zero(&mut self, width: u8, target: DynamicLabel) {
        let data = self.data;
        match width {
            1 => asm!(self.ops ; cmp BYTE [Rq(data)], 0),
            2 => asm!(self.ops ; cmp WORD [Rq(data)], 0),
            4 => asm!(self.ops ; cmp DWORD [Rq(data)], 0),
            _ => asm!(self.ops ; cmp QWORD [Rq(data)], 0),
        }
        asm!(self.ops ; je =>target);
    }

    // --- decode ---

    pub fn skip_ws(&mut self) {
        let (cur, end) = (self.a, self.b);
        let top = self.new_label();
        let advance = self.new_label();
        let done = self.new_label();
        asm!(self.ops
            ; =>top
            ; cmp Rq(cur), Rq(end)
            ; jae =>done
            ; movzx eax, BYTE [Rq(cur)]
            ; cmp eax, 0x20
            ; je =>advance
            ; ja =>done
            ; cmp eax, 0x0a
            ; je =>advance
            ; cmp eax, 0x0d
            ; je =>advance
            ; cmp eax, 0x09
            ; jne =>done
            ; =>advance
            ; add Rq(cur), 1
            ; jmp =>top
            ; =>done
        );
    }

    /// Jump to `miss` unless the next byte is `byte`. Does not consume.
    fn peek_is(&mut self, byte: u8, miss: DynamicLabel) {
        let (cur, end) = (self.a, self.b);
        asm!(self.ops
            ; cmp Rq(cur), Rq(end)
            ; jae =>miss
            ; cmp BYTE [Rq(cur)], byte as i8
            ; jne =>miss
        );
    }

    fn consume(&mut self, n: i32) {
        let cur = self.a;
        asm!(self.ops ; add Rq(cur), n);
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
            ; mov rax, Rq(end)
            ; sub rax, Rq(cur)
            ; cmp rax, 4
            ; jb =>miss
            ; cmp DWORD [Rq(cur)], NULL
            ; jne =>miss
            ; add Rq(cur), 4
            ; jmp =>target
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
    fn frame_keeps_calls_aligned() {
        for layout in [
            FrameLayout::default(),
            FrameLayout {
                loop_state: true,
                result: false,
                scratch: false,
            },
            FrameLayout {
                loop_state: true,
                result: true,
                scratch: true,
            },
        ] {
            let (_, frame) = role_table(Direction::Encode, layout).unwrap();
            assert_eq!((56 + frame) % 16, 0, "{layout:?}");
        }
    }

    #[test]
    fn role_tables_have_no_aliases() {
        let layout = FrameLayout {
            loop_state: true,
            result: true,
            scratch: true,
        };
        let (enc, _) = role_table(Direction::Encode, layout).unwrap();
        assert_eq!(enc.get(Role::Len), Some(Loc::Reg(R13)));
        assert_eq!(enc.get(Role::Cursor), None);
        let (dec, _) = role_table(Direction::Decode, layout).unwrap();
        assert_eq!(dec.get(Role::Cursor), Some(Loc::Reg(R12)));
        assert_eq!(dec.get(Role::Cap), None);
    }

    #[test]
    fn missing_role_is_a_compile_error() {
        let mut e = EmitCtx::new(Direction::Encode, FrameLayout::default()).unwrap();
        e.prologue();
        e.seq_next(e.error_exit);
        e.epilogue();
        assert!(matches!(e.finish(), Err(CompileError::Assembly(_))));
    }
}
