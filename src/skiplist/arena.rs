use std::{
    mem::size_of,
    sync::atomic::{AtomicUsize, Ordering},
};

const BLOCK_SIZE: usize = 4096;
const POINTER_LENGTH: usize = size_of::<*mut u8>();

/// Bump allocator backing one memtable. Chunks never shrink or move; the
/// whole arena is dropped with the memtable that owns it.
pub struct Arena {
    p: *mut u8,
    remain: usize,
    usage: AtomicUsize,
    blocks: Vec<Vec<u8>>,
}

unsafe impl Send for Arena {}

impl Arena {
    pub fn new() -> Self {
        Arena {
            p: std::ptr::null_mut(),
            remain: 0,
            usage: AtomicUsize::new(0),
            blocks: Vec::new(),
        }
    }

    pub fn allocate(&mut self, n: usize) -> *mut u8 {
        assert!(n > 0);
        if n <= self.remain {
            let result = self.p;
            unsafe {
                self.p = self.p.add(n);
            }
            self.remain -= n;
            result
        } else {
            self.allocate_fallback(n)
        }
    }

    pub fn allocate_aligned(&mut self, n: usize) -> *mut u8 {
        let align = POINTER_LENGTH.max(8);
        let current_mod = self.p as usize & (align - 1);
        let slop = if current_mod == 0 {
            0
        } else {
            align - current_mod
        };
        let needed = n + slop;
        if needed <= self.remain {
            let result = unsafe {
                let result = self.p.add(slop);
                self.p = self.p.add(needed);
                result
            };
            self.remain -= needed;
            result
        } else {
            // Fresh blocks are at least pointer-aligned already.
            self.allocate_fallback(n)
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&mut self, n: usize) -> *mut u8 {
        if n > BLOCK_SIZE / 4 {
            // Large objects get their own block so the current block's
            // remainder is not wasted.
            return self.allocate_new_block(n);
        }

        self.p = self.allocate_new_block(BLOCK_SIZE);
        self.remain = BLOCK_SIZE;
        let result = self.p;
        unsafe {
            self.p = self.p.add(n);
        }
        self.remain -= n;
        result
    }

    fn allocate_new_block(&mut self, block_bytes: usize) -> *mut u8 {
        let mut v: Vec<u8> = Vec::with_capacity(block_bytes);
        let r = v.as_mut_ptr();
        self.blocks.push(v);
        self.usage
            .fetch_add(block_bytes + size_of::<Vec<u8>>(), Ordering::Relaxed);
        r
    }
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new()
    }
}
