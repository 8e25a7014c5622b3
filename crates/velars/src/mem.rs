// Allocator interface.
//
// Every sized allocation the runtime performs flows through one
// observation point, the state's `Allocator`. The hook sees the old and
// new size of each block and may refuse a growth; a refusal triggers an
// emergency collection and one retry before the runtime reports
// out-of-memory. Frees and shrinks are never refused.

use crate::vm::{runtime_error, VelaResult};

pub trait Allocator {
    /// Observe a reallocation from `old_size` to `new_size` bytes.
    /// `old_size == 0` is a fresh allocation, `new_size == 0` a free.
    /// Returning false refuses the request; refusing a shrink or free
    /// is ignored.
    fn realloc(&mut self, old_size: usize, new_size: usize) -> bool;
}

/// Accepts everything; the process allocator is the only limit.
pub struct DefaultAllocator;

impl Allocator for DefaultAllocator {
    #[inline]
    fn realloc(&mut self, _old_size: usize, _new_size: usize) -> bool {
        true
    }
}

pub(crate) const MIN_SIZE_ARRAY: usize = 4;

/// Growth policy for dynamic arrays: double, with a floor of
/// `MIN_SIZE_ARRAY` elements; near the limit, clamp to it and error
/// once it is reached.
pub(crate) fn grow_size(size: usize, limit: usize, what: &str) -> VelaResult<usize> {
    if size >= limit / 2 {
        if size >= limit {
            return runtime_error(format!("too many {} (limit is {})", what, limit));
        }
        Ok(limit)
    } else {
        Ok((size * 2).max(MIN_SIZE_ARRAY))
    }
}
