/// Construction-time configuration for a [`VelaVM`](crate::VelaVM).
///
/// Everything here is fixed at state creation; the GC pacing knobs can
/// later be adjusted through `set_gc_pause` / `set_gc_stepmul`.
#[derive(Debug, Clone)]
pub struct VelaOptions {
    /// Pause between GC cycles, in percent of the live estimate (default 200)
    pub gc_pause: i32,
    /// GC speed relative to allocation, in percent (default 200)
    pub gc_stepmul: i32,
    /// Strings up to this length are interned; longer ones are not (default 40)
    pub short_string_limit: usize,
    /// Initial value-stack size for new threads
    pub initial_stack_size: usize,
    /// Hard limit on a thread's value stack
    pub max_stack_size: usize,
    /// Force a full collection before every growth (allocator stress mode)
    pub hardened_alloc: bool,
}

impl Default for VelaOptions {
    fn default() -> Self {
        Self {
            gc_pause: 200,
            gc_stepmul: 200,
            short_string_limit: 40,
            initial_stack_size: 40,
            max_stack_size: 1_000_000,
            hardened_alloc: false,
        }
    }
}
