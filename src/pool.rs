//! Reusable memory: byte buffers for encoding output and executable pages
//! for compiled routines.
//!
//! Both are kept in power-of-two size classes, each behind its own lock, so
//! concurrent callers working on different sizes never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dynasmrt::mmap::{ExecutableBuffer, MutableBuffer};
use parking_lot::Mutex;

use crate::error::CompileError;

const BUF_MIN_SHIFT: u32 = 8;
const BUF_MAX_SHIFT: u32 = 24;
const PAGE_MIN_SHIFT: u32 = 12;
const PAGE_MAX_SHIFT: u32 = 20;

/// Smallest class index whose size is at least `n`.
fn class_at_least(n: usize, min_shift: u32) -> u32 {
    let shift = n.max(1).next_power_of_two().trailing_zeros().max(min_shift);
    shift - min_shift
}

/// Largest class index whose size is at most `n`, if any.
fn class_at_most(n: usize, min_shift: u32) -> Option<u32> {
    if n < 1 << min_shift {
        return None;
    }
    Some(usize::BITS - 1 - n.leading_zeros() - min_shift)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub buffers_allocated: u64,
    pub buffers_reused: u64,
    pub pages_allocated: u64,
    pub pages_reused: u64,
}

#[derive(Default)]
struct Counters {
    buffers_allocated: AtomicU64,
    buffers_reused: AtomicU64,
    pages_allocated: AtomicU64,
    pages_reused: AtomicU64,
}

pub struct MemoryPool {
    buffers: Vec<Mutex<Vec<Vec<u8>>>>,
    pages: Vec<Mutex<Vec<MutableBuffer>>>,
    max_retained: usize,
    counters: Counters,
}

impl MemoryPool {
    pub fn new(max_retained: usize) -> Arc<Self> {
        Arc::new(MemoryPool {
            buffers: (BUF_MIN_SHIFT..=BUF_MAX_SHIFT).map(|_| Mutex::new(Vec::new())).collect(),
            pages: (PAGE_MIN_SHIFT..=PAGE_MAX_SHIFT).map(|_| Mutex::new(Vec::new())).collect(),
            max_retained,
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffers_allocated: self.counters.buffers_allocated.load(Ordering::Relaxed),
            buffers_reused: self.counters.buffers_reused.load(Ordering::Relaxed),
            pages_allocated: self.counters.pages_allocated.load(Ordering::Relaxed),
            pages_reused: self.counters.pages_reused.load(Ordering::Relaxed),
        }
    }

    /// An empty buffer with capacity for at least `min_capacity` bytes.
    /// `None` if the allocation failed.
    pub fn checkout(self: &Arc<Self>, min_capacity: usize) -> Option<PooledBuf> {
        let class = class_at_least(min_capacity, BUF_MIN_SHIFT);
        if let Some(list) = self.buffers.get(class as usize)
            && let Some(vec) = list.lock().pop()
        {
            self.counters.buffers_reused.fetch_add(1, Ordering::Relaxed);
            return Some(PooledBuf {
                vec,
                pool: Arc::downgrade(self),
            });
        }
        let size = if (class as usize) < self.buffers.len() {
            1usize << (class + BUF_MIN_SHIFT)
        } else {
            min_capacity
        };
        let mut vec = Vec::new();
        if vec.try_reserve_exact(size).is_err() {
            tracing::trace!(size, "buffer allocation refused");
            return None;
        }
        self.counters.buffers_allocated.fetch_add(1, Ordering::Relaxed);
        Some(PooledBuf {
            vec,
            pool: Arc::downgrade(self),
        })
    }

    fn give_back(&self, mut vec: Vec<u8>) {
        let Some(class) = class_at_most(vec.capacity(), BUF_MIN_SHIFT) else {
            return;
        };
        let Some(list) = self.buffers.get(class as usize) else {
            return;
        };
        let mut list = list.lock();
        if list.len() < self.max_retained {
            vec.clear();
            list.push(vec);
        }
    }

    /// Copy `code` into an executable page.
    pub fn alloc_exec(self: &Arc<Self>, code: &[u8]) -> Result<ExecPage, CompileError> {
        let class = class_at_least(code.len(), PAGE_MIN_SHIFT);
        let pooled = (class as usize) < self.pages.len();
        let reused = if pooled {
            self.pages[class as usize].lock().pop()
        } else {
            None
        };
        let mut buf = match reused {
            Some(buf) => {
                self.counters.pages_reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                let size = if pooled {
                    1usize << (class + PAGE_MIN_SHIFT)
                } else {
                    code.len()
                };
                self.counters.pages_allocated.fetch_add(1, Ordering::Relaxed);
                MutableBuffer::new(size).map_err(|e| CompileError::ExecutableMemory(e.to_string()))?
            }
        };
        buf.set_len(code.len());
        buf[..code.len()].copy_from_slice(code);
        let exec = buf
            .make_exec()
            .map_err(|e| CompileError::ExecutableMemory(e.to_string()))?;
        #[cfg(target_arch = "aarch64")]
        dynasmrt::cache_control::synchronize_icache(&exec[..code.len()]);
        tracing::trace!(bytes = code.len(), class, "placed code in executable page");
        Ok(ExecPage {
            buf: Some(exec),
            class: pooled.then_some(class),
            pool: Arc::downgrade(self),
        })
    }

    fn give_back_page(&self, class: u32, exec: ExecutableBuffer) {
        let mut list = self.pages[class as usize].lock();
        if list.len() >= self.max_retained {
            return;
        }
        match exec.make_mut() {
            Ok(buf) => list.push(buf),
            Err(e) => tracing::debug!(error = %e, "dropping executable page that could not be made writable"),
        }
    }
}

/// A byte buffer that returns to its pool when dropped.
pub struct PooledBuf {
    vec: Vec<u8>,
    pool: Weak<MemoryPool>,
}

impl PooledBuf {
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.vec.as_mut_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.vec.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.vec
    }

    /// # Safety
    /// The first `len` bytes must be initialized and `len <= capacity()`.
    pub unsafe fn set_len(&mut self, len: usize) {
        unsafe { self.vec.set_len(len) }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(core::mem::take(&mut self.vec));
        }
    }
}

/// Executable memory holding one compiled routine. Returns its page to the
/// pool when dropped.
pub struct ExecPage {
    buf: Option<ExecutableBuffer>,
    class: Option<u32>,
    pool: Weak<MemoryPool>,
}

impl ExecPage {
    pub fn code(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    pub fn entry(&self) -> *const u8 {
        self.code().as_ptr()
    }
}

impl Drop for ExecPage {
    fn drop(&mut self) {
        let (Some(buf), Some(class)) = (self.buf.take(), self.class) else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back_page(class, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(class_at_least(1, BUF_MIN_SHIFT), 0);
        assert_eq!(class_at_least(256, BUF_MIN_SHIFT), 0);
        assert_eq!(class_at_least(257, BUF_MIN_SHIFT), 1);
        assert_eq!(class_at_most(255, BUF_MIN_SHIFT), None);
        assert_eq!(class_at_most(256, BUF_MIN_SHIFT), Some(0));
        assert_eq!(class_at_most(600, BUF_MIN_SHIFT), Some(1));
    }

    #[test]
    fn buffers_are_reused() {
        let pool = MemoryPool::new(4);
        let mut a = pool.checkout(1000).unwrap();
        assert!(a.capacity() >= 1000);
        let ptr = a.as_mut_ptr();
        drop(a);
        let mut b = pool.checkout(900).unwrap();
        assert_eq!(b.as_mut_ptr(), ptr);
        assert!(b.as_slice().is_empty());
        let stats = pool.stats();
        assert_eq!(stats.buffers_allocated, 1);
        assert_eq!(stats.buffers_reused, 1);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = MemoryPool::new(1);
        let a = pool.checkout(10).unwrap();
        let b = pool.checkout(10).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.buffers[0].lock().len(), 1);
    }

    #[test]
    fn exec_pages_hold_code_and_recycle() {
        let pool = MemoryPool::new(4);
        let page = pool.alloc_exec(&[0xc3, 0x90, 0x90]).unwrap();
        assert_eq!(page.code(), &[0xc3, 0x90, 0x90]);
        drop(page);
        let page = pool.alloc_exec(&[0xc3]).unwrap();
        assert_eq!(page.code(), &[0xc3]);
        assert_eq!(pool.stats().pages_reused, 1);
    }

    #[test]
    fn buffers_outliving_the_pool_are_freed() {
        let pool = MemoryPool::new(4);
        let buf = pool.checkout(10).unwrap();
        drop(pool);
        drop(buf);
    }
}
