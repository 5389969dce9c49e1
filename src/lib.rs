//! Memory core for a small kernel: a chunked bitmap heap and a
//! reference-counting collector on top of it.
//!
//! The kernel and every process each get their own [`AllocatorContext`];
//! [`MemoryManager`] owns the kernel context and the current process context.
//!
//! ```
//! use std::sync::Arc;
//! use kgc::{mmap::MmapPageProvider, type_table::TypeDescriptor, Config, MemoryManager};
//!
//! let mm = MemoryManager::new(Config::default(), Arc::new(MmapPageProvider::new())).unwrap();
//! let node = mm.types().define(TypeDescriptor::class("Node").reference("next")).unwrap();
//! let ctx = mm.current();
//! let obj = ctx.new_object(node).unwrap();
//! ctx.decrement_ref_count(obj);
//! assert_eq!(ctx.cleanup().freed_objects, 1);
//! ```

/// Log at info level when `$cond` holds, at debug level otherwise.
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        } else {
            log::debug!($($t)*);
        }
    };
}

/// rounds the given value `value` up to the nearest multiple
/// of `align`
pub fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

pub mod context;
pub mod gc;
pub mod gcref;
pub mod globals;
pub mod header;
pub mod heap;
pub mod internal;
pub mod mmap;
pub mod region;
pub mod statistics;
pub mod type_table;

pub use context::{AllocatorContext, ExecutionContext, MemoryManager};
pub use gc::{AccessError, AllocError, DecrementOutcome, SweepStats};
pub use gcref::GcRef;

use globals::{CHUNK_SIZE, EXPANSION_SIZE, INITIAL_EXPANSION_SIZE};

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes per chunk. Power of two, at least 16.
    pub chunk_size: usize,
    /// Size of the first region a heap grows by
    pub initial_expansion: usize,
    /// Size of every later region, unless a request needs more
    pub expansion_size: usize,
    /// Upper bound on the bytes a heap may request from the page provider
    pub max_heap_size: Option<usize>,
    /// Report expansions and sweeps at info level
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            initial_expansion: INITIAL_EXPANSION_SIZE,
            expansion_size: EXPANSION_SIZE,
            max_heap_size: None,
            verbose: false,
        }
    }
}
