use crate::context::{ErrorCode, ErrorSlot};

/// One saved set of register roles: data pointer, container cursor,
/// remaining count and element size.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecursionFrame {
    pub data: u64,
    pub iter: u64,
    pub count: u64,
    pub elem: u64,
}

/// log2 of `size_of::<RecursionFrame>()`, used by generated code to index frames.
pub const FRAME_SHIFT: u32 = 5;

const _: () = assert!(core::mem::size_of::<RecursionFrame>() == 1 << FRAME_SHIFT);

/// Growable stack of frames shared by every routine in one encode or decode call.
///
/// Generated code pushes inline while `top < cap` and calls
/// [`jitson_stack_grow`] otherwise. Growth never shrinks and stops at `limit`.
#[repr(C)]
pub struct RecursionStack {
    pub frames: *mut RecursionFrame,
    pub top: usize,
    pub cap: usize,
    pub limit: usize,
    storage: Vec<RecursionFrame>,
}

pub const STACK_FRAMES: u32 = core::mem::offset_of!(RecursionStack, frames) as u32;
pub const STACK_TOP: u32 = core::mem::offset_of!(RecursionStack, top) as u32;
pub const STACK_CAP: u32 = core::mem::offset_of!(RecursionStack, cap) as u32;

impl RecursionStack {
    pub fn new(initial: usize, limit: usize) -> Self {
        let cap = initial.min(limit);
        let mut storage = vec![RecursionFrame::default(); cap];
        RecursionStack {
            frames: storage.as_mut_ptr(),
            top: 0,
            cap,
            limit,
            storage,
        }
    }

    pub fn depth(&self) -> usize {
        self.top
    }

    /// Double the capacity, bounded by `limit`. Returns `false` when already at the limit.
    pub fn grow(&mut self) -> bool {
        if self.cap >= self.limit {
            return false;
        }
        let next = (self.cap * 2).max(16).min(self.limit);
        self.storage.resize(next, RecursionFrame::default());
        self.frames = self.storage.as_mut_ptr();
        self.cap = next;
        tracing::trace!(cap = next, "grew recursion stack");
        true
    }

    pub fn push(&mut self, frame: RecursionFrame) -> bool {
        if self.top == self.cap && !self.grow() {
            return false;
        }
        self.storage[self.top] = frame;
        self.top += 1;
        true
    }

    pub fn peek(&self) -> Option<&RecursionFrame> {
        self.top.checked_sub(1).map(|i| &self.storage[i])
    }

    pub fn pop(&mut self) -> Option<RecursionFrame> {
        let i = self.top.checked_sub(1)?;
        self.top = i;
        Some(self.storage[i])
    }

    /// Drop every frame, e.g. after a routine bailed out through its error exit.
    pub fn reset(&mut self) {
        self.top = 0;
    }
}

/// Called by generated code when a frame push finds the stack full.
///
/// # Safety
/// `stack` and `error` must be valid for the duration of the call.
pub unsafe extern "C" fn jitson_stack_grow(stack: *mut RecursionStack, error: *mut ErrorSlot) {
    let stack = unsafe { &mut *stack };
    if !stack.grow() {
        let error = unsafe { &mut *error };
        if error.code == 0 {
            error.code = ErrorCode::StackOverflow as u32;
            error.payload = stack.top as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> RecursionFrame {
        RecursionFrame {
            data: n,
            iter: n + 1,
            count: n + 2,
            elem: n + 3,
        }
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut stack = RecursionStack::new(2, 8);
        assert!(stack.push(frame(1)));
        assert!(stack.push(frame(10)));
        assert_eq!(stack.peek(), Some(&frame(10)));
        assert_eq!(stack.pop(), Some(frame(10)));
        assert_eq!(stack.pop(), Some(frame(1)));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn grows_up_to_limit_then_refuses() {
        let mut stack = RecursionStack::new(1, 20);
        for i in 0..20 {
            assert!(stack.push(frame(i)), "push {i}");
        }
        assert_eq!(stack.cap, 20);
        assert!(!stack.push(frame(99)));
        assert_eq!(stack.depth(), 20);
        // Existing frames survive reallocation.
        assert_eq!(stack.peek(), Some(&frame(19)));
    }

    #[test]
    fn grow_intrinsic_reports_overflow() {
        let mut stack = RecursionStack::new(4, 4);
        let mut slot = ErrorSlot::default();
        unsafe { jitson_stack_grow(&mut stack, &mut slot) };
        assert_eq!(slot.code, ErrorCode::StackOverflow as u32);

        let mut stack = RecursionStack::new(4, 64);
        let mut slot = ErrorSlot::default();
        unsafe { jitson_stack_grow(&mut stack, &mut slot) };
        assert_eq!(slot.code, 0);
        assert_eq!(stack.cap, 16);
    }
}
