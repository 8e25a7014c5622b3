// Per-call frame bookkeeping.

use crate::value::NativeFn;

/// Call status flags.
pub mod call_status {
    /// Scripted frame (owns a saved program counter)
    pub const CIST_SCRIPT: u32 = 1 << 0;
    /// A debug hook is running in this frame
    pub const CIST_HOOKED: u32 = 1 << 1;
    /// Yieldable protected call
    pub const CIST_YPCALL: u32 = 1 << 2;
    /// Frame entered through a tail call
    pub const CIST_TAIL: u32 = 1 << 3;
    /// Frame is running a finalizer
    pub const CIST_FIN: u32 = 1 << 4;
    /// Less-equal implemented through less-than in this frame
    pub const CIST_LEQ: u32 = 1 << 5;
    /// A hook yielded out of this frame
    pub const CIST_HOOKYIELD: u32 = 1 << 6;
    /// Frame started a fresh native invocation of the interpreter
    pub const CIST_FRESH: u32 = 1 << 7;
    /// Original allow-hook flag, restored on error recovery
    pub const CIST_OAH: u32 = 1 << 8;
}

/// One frame of a thread's call chain.
#[derive(Clone)]
pub struct CallInfo {
    /// Absolute stack index of the function being called
    pub func: usize,
    /// Frame top: first stack slot past this frame
    pub top: usize,
    /// Number of results expected by the caller (-1 = all)
    pub nresults: i32,
    /// Saved program counter (scripted frames)
    pub pc: u32,
    /// Continuation to run when a yielded native call resumes
    pub continuation: Option<NativeFn>,
    /// Context value handed back to the continuation
    pub ctx: i64,
    pub status: u32,
}

impl CallInfo {
    pub fn new_script(func: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            top,
            nresults,
            pc: 0,
            continuation: None,
            ctx: 0,
            status: call_status::CIST_SCRIPT,
        }
    }

    pub fn new_native(func: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            top,
            nresults,
            pc: 0,
            continuation: None,
            ctx: 0,
            status: 0,
        }
    }

    #[inline(always)]
    pub fn is_scripted(&self) -> bool {
        self.status & call_status::CIST_SCRIPT != 0
    }

    #[inline(always)]
    pub fn is_tail_call(&self) -> bool {
        self.status & call_status::CIST_TAIL != 0
    }

    #[inline(always)]
    pub fn is_finalizer(&self) -> bool {
        self.status & call_status::CIST_FIN != 0
    }
}

impl Default for CallInfo {
    fn default() -> Self {
        CallInfo {
            func: 0,
            top: 0,
            nresults: -1,
            pc: 0,
            continuation: None,
            ctx: 0,
            status: 0,
        }
    }
}
