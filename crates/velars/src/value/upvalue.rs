// Upvalues: the lifetime bridge between stack locals and closures.
//
// An open upvalue names a live stack slot of some thread; a closed one
// carries the value inline. The enum discriminant is the open/closed
// predicate, so the two states cannot be confused.

use crate::gc::ThreadId;
use crate::value::VelaValue;

pub enum UpvalState {
    Open {
        thread: ThreadId,
        /// Absolute index into the owning thread's value stack
        level: usize,
        /// Activity mark for the current GC cycle; an open upvalue of a
        /// dead thread that was never touched becomes collectible.
        touched: bool,
    },
    Closed(VelaValue),
}

pub struct VelaUpvalue {
    /// Number of closures holding this upvalue
    pub refcount: u32,
    pub state: UpvalState,
}

impl VelaUpvalue {
    pub fn new_open(thread: ThreadId, level: usize) -> Self {
        VelaUpvalue {
            refcount: 0,
            state: UpvalState::Open { thread, level, touched: true },
        }
    }

    pub fn new_closed(value: VelaValue) -> Self {
        VelaUpvalue { refcount: 0, state: UpvalState::Closed(value) }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalState::Open { .. })
    }

    /// Stack level of an open upvalue.
    #[inline]
    pub fn level(&self) -> Option<usize> {
        match self.state {
            UpvalState::Open { level, .. } => Some(level),
            UpvalState::Closed(_) => None,
        }
    }

    /// Move the captured value inline; the list unlink is the caller's job.
    #[inline]
    pub fn close(&mut self, value: VelaValue) {
        debug_assert!(self.is_open());
        self.state = UpvalState::Closed(value);
    }

    /// Record activity in the current GC cycle.
    #[inline]
    pub fn touch(&mut self) {
        if let UpvalState::Open { touched, .. } = &mut self.state {
            *touched = true;
        }
    }

    #[inline]
    pub fn touched(&self) -> bool {
        matches!(self.state, UpvalState::Open { touched: true, .. })
    }

    #[inline]
    pub fn closed_value(&self) -> Option<VelaValue> {
        match &self.state {
            UpvalState::Closed(v) => Some(*v),
            UpvalState::Open { .. } => None,
        }
    }
}
