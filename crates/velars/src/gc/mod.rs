// Incremental tri-color mark/sweep collector.
//
// Two white parities distinguish objects born during a sweep from the
// previous cycle's survivors. The cycle is a state machine advanced in
// bounded steps between mutator operations:
//
//   Pause -> Propagate -> (atomic) -> SwpAllGc -> SwpFinObj
//         -> SwpToBeFnz -> SwpEnd -> CallFin -> Pause
//
// Every object is in exactly one of the `allgc`, `finobj`, `tobefnz`,
// `fixedgc` lists. Gray objects additionally sit in `gray` or
// `grayagain`; weak tables discovered during traversal collect in
// `weak`, `ephemeron` and `allweak` for the atomic clearing passes.
//
// The invariant is that a black object never references a white one:
// the forward barrier marks the sink, the back barrier (tables) reverts
// the container to gray for an atomic revisit.

mod gc_id;
mod header;
pub(crate) mod object_pool;
pub(crate) mod string_table;

pub use gc_id::*;
pub use header::*;
pub use object_pool::{GcBox, ObjectPool, Pool};
pub use string_table::{StringTable, VelaStr};

use log::{debug, warn};

use crate::mem::Allocator;
use crate::value::table::Strings;
use crate::value::{UpvalState, VelaClosure, VelaValue, Proto, NUM_TYPES};

/// Bound on objects swept per step.
const GCSWEEPMAX: usize = 100;
/// Work units granted per step beyond the scaled debt.
const GCSTEPSIZE: isize = 100 * 16;
/// Scale between debt bytes and work units.
const STEPMULADJ: isize = 200;
/// Safety bound for ephemeron convergence.
const MAX_EPHEMERON_ROUNDS: usize = 1000;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcState {
    Propagate = 0,
    EnterAtomic = 1,
    SwpAllGc = 2,
    SwpFinObj = 3,
    SwpToBeFnz = 4,
    SwpEnd = 5,
    CallFin = 6,
    Pause = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Normal,
    /// Collection forced by an allocation failure: no finalizers run,
    /// no string-table resize.
    Emergency,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub objects_collected: usize,
    pub bytes_freed: usize,
    pub emergency_collections: usize,
}

/// Everything a collection step needs from the owning state.
pub(crate) struct GcCtx<'a> {
    pub pool: &'a mut ObjectPool,
    pub strt: &'a mut StringTable,
    pub alloc: &'a mut dyn Allocator,
    pub main_thread: ThreadId,
    pub registry: VelaValue,
    pub basic_mt: [Option<TableId>; NUM_TYPES],
    /// Interned "__mode" string, once the state is built
    pub mode_str: Option<StrId>,
}

enum StepResult {
    /// Traversal or sweep work, in byte-sized units
    Work(isize),
    /// Atomic phase ran
    Atomic(isize),
    /// Cycle finished
    Pause,
}

pub struct Gc {
    pub(crate) state: GcState,
    pub(crate) kind: GcKind,
    /// Collector enabled (stop()/restart())
    pub(crate) running: bool,
    /// Blocks finalizer dispatch while one is already running
    pub(crate) stopem: bool,
    pub(crate) current_white: u8,
    /// Allocation debt in bytes; a positive debt triggers steps
    pub(crate) debt: isize,
    /// Live bytes as observed by the allocator hook
    pub(crate) total_bytes: usize,
    /// Live-size estimate at the end of the last cycle
    pub(crate) estimate: usize,
    pub(crate) pause: i32,
    pub(crate) stepmul: i32,

    // ---- object lists ----
    pub(crate) allgc: Vec<GcId>,
    pub(crate) finobj: Vec<GcId>,
    pub(crate) tobefnz: Vec<GcId>,
    pub(crate) fixedgc: Vec<GcId>,

    // ---- mark lists ----
    pub(crate) gray: Vec<GcId>,
    pub(crate) grayagain: Vec<GcId>,
    weak: Vec<TableId>,
    ephemeron: Vec<TableId>,
    allweak: Vec<TableId>,
    /// Threads with open upvalues
    pub(crate) twups: Vec<ThreadId>,
    /// Objects handed to the mutator for finalization but not yet
    /// finalized; rooted so a nested collection cannot reclaim them
    pub(crate) finalizing: Vec<GcId>,

    // ---- sweep cursors over the list being swept ----
    sweep_read: usize,
    sweep_write: usize,
    /// True while the atomic remark is running
    atomic_phase: bool,

    pub stats: GcStats,
}

impl Gc {
    pub fn new(pause: i32, stepmul: i32) -> Self {
        Gc {
            state: GcState::Pause,
            kind: GcKind::Normal,
            running: true,
            stopem: false,
            current_white: 0,
            debt: 0,
            total_bytes: 0,
            estimate: 0,
            pause,
            stepmul,
            allgc: Vec::new(),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
            fixedgc: Vec::new(),
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(32),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            twups: Vec::new(),
            finalizing: Vec::new(),
            sweep_read: 0,
            sweep_write: 0,
            atomic_phase: false,
            stats: GcStats::default(),
        }
    }

    /// Black objects may not reference white ones while marking runs.
    #[inline]
    pub fn keep_invariant(&self) -> bool {
        self.state <= GcState::EnterAtomic || self.atomic_phase
    }

    #[inline]
    pub fn is_sweep_phase(&self) -> bool {
        matches!(
            self.state,
            GcState::SwpAllGc | GcState::SwpFinObj | GcState::SwpToBeFnz
        )
    }

    /// Replace the debt, e.g. to grant credit until the next step.
    pub fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    // ============ Stepping ============

    /// Run collector steps proportional to the accumulated debt.
    /// Returns objects whose finalizers the caller must now run.
    pub(crate) fn step(&mut self, ctx: &mut GcCtx) -> Vec<GcId> {
        let mut pending = Vec::new();
        if !self.running {
            self.set_debt(-GCSTEPSIZE * 10);
            return pending;
        }
        // scale debt into work units
        let mut work2do = if self.debt <= 0 {
            0
        } else {
            let d = self.debt / STEPMULADJ + 1;
            d.saturating_mul(self.stepmul as isize)
        };
        loop {
            let res = self.single_step(ctx, &mut pending);
            match res {
                StepResult::Pause => {
                    self.set_pause();
                    return pending;
                }
                StepResult::Atomic(w) | StepResult::Work(w) => {
                    work2do -= w;
                }
            }
            if work2do <= -GCSTEPSIZE {
                break;
            }
        }
        // grant credit before the next step fires
        self.set_debt((work2do / self.stepmul.max(1) as isize) * STEPMULADJ);
        pending
    }

    fn single_step(&mut self, ctx: &mut GcCtx, pending: &mut Vec<GcId>) -> StepResult {
        match self.state {
            GcState::Pause => {
                self.restart_collection(ctx);
                self.state = GcState::Propagate;
                StepResult::Work(1)
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.state = GcState::EnterAtomic;
                    StepResult::Work(1)
                } else {
                    StepResult::Work(self.propagate_mark(ctx))
                }
            }
            GcState::EnterAtomic => {
                let work = self.atomic(ctx);
                self.enter_sweep();
                StepResult::Atomic(work)
            }
            GcState::SwpAllGc => {
                let work = self.sweep_step(ListKind::Allgc, ctx, GCSWEEPMAX);
                if self.sweep_done(ListKind::Allgc) {
                    self.begin_sweep(ListKind::Finobj);
                    self.state = GcState::SwpFinObj;
                }
                StepResult::Work(work)
            }
            GcState::SwpFinObj => {
                let work = self.sweep_step(ListKind::Finobj, ctx, GCSWEEPMAX);
                if self.sweep_done(ListKind::Finobj) {
                    self.begin_sweep(ListKind::Tobefnz);
                    self.state = GcState::SwpToBeFnz;
                }
                StepResult::Work(work)
            }
            GcState::SwpToBeFnz => {
                let work = self.sweep_step(ListKind::Tobefnz, ctx, GCSWEEPMAX);
                if self.sweep_done(ListKind::Tobefnz) {
                    self.state = GcState::SwpEnd;
                }
                StepResult::Work(work)
            }
            GcState::SwpEnd => {
                if self.kind != GcKind::Emergency {
                    ctx.strt.shrink_if_sparse(&ctx.pool.strings);
                }
                self.state = GcState::CallFin;
                StepResult::Work(GCSWEEPMAX as isize)
            }
            GcState::CallFin => {
                if !self.tobefnz.is_empty() && self.kind != GcKind::Emergency && !self.stopem {
                    // reverse attachment order
                    let id = self.tobefnz.pop().expect("checked non-empty");
                    if let Some(h) = ctx.pool.header_mut(id) {
                        h.make_white(self.current_white);
                        h.clear_finalized();
                    }
                    self.allgc.push(id);
                    self.finalizing.push(id);
                    pending.push(id);
                    StepResult::Work(GCSWEEPMAX as isize)
                } else {
                    self.finish_cycle();
                    StepResult::Pause
                }
            }
        }
    }

    fn finish_cycle(&mut self) {
        self.state = GcState::Pause;
        self.kind = GcKind::Normal;
        self.estimate = self.total_bytes;
        self.stats.cycles += 1;
        debug!(
            target: "velars::gc",
            "cycle {} complete: {} live bytes, estimate {}",
            self.stats.cycles, self.total_bytes, self.estimate
        );
    }

    /// Post-cycle pacing: next collection starts once total bytes grow
    /// past pause% of the live estimate.
    fn set_pause(&mut self) {
        let estimate = (self.estimate.max(1)) as isize;
        let threshold = estimate.saturating_mul(self.pause as isize) / 100;
        self.set_debt(self.total_bytes as isize - threshold);
    }

    /// Drive a full collection to completion. Pending finalizable
    /// objects are returned for the caller to run (empty in emergency).
    pub(crate) fn full(&mut self, ctx: &mut GcCtx, emergency: bool) -> Vec<GcId> {
        let mut pending = Vec::new();
        let kind = if emergency { GcKind::Emergency } else { GcKind::Normal };
        if emergency {
            self.stats.emergency_collections += 1;
        }
        self.kind = kind;
        if self.keep_invariant() && self.state != GcState::Pause {
            // finish the interrupted cycle by sweeping everything back
            // to white, without running the atomic phase
            self.gray.clear();
            self.grayagain.clear();
            self.weak.clear();
            self.ephemeron.clear();
            self.allweak.clear();
            self.enter_sweep();
        }
        self.run_until_pause(ctx, &mut pending);
        // a fresh, complete cycle
        self.kind = kind;
        self.run_one_cycle(ctx, &mut pending);
        self.set_pause();
        self.kind = GcKind::Normal;
        pending
    }

    fn run_until_pause(&mut self, ctx: &mut GcCtx, pending: &mut Vec<GcId>) {
        const MAX_ITERATIONS: usize = 10_000_000;
        let mut iterations = 0;
        while self.state != GcState::Pause {
            self.single_step(ctx, pending);
            iterations += 1;
            if iterations >= MAX_ITERATIONS {
                debug_assert!(false, "collector failed to reach pause");
                break;
            }
        }
    }

    fn run_one_cycle(&mut self, ctx: &mut GcCtx, pending: &mut Vec<GcId>) {
        debug_assert_eq!(self.state, GcState::Pause);
        self.single_step(ctx, pending); // Pause -> Propagate
        self.run_until_pause(ctx, pending);
    }

    // ============ Cycle start ============

    fn restart_collection(&mut self, ctx: &mut GcCtx) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
        self.mark_roots(ctx);
    }

    fn mark_roots(&mut self, ctx: &mut GcCtx) {
        self.mark_object(GcId::Thread(ctx.main_thread), ctx.pool);
        let registry = ctx.registry;
        self.mark_value(&registry, ctx.pool);
        for mt in ctx.basic_mt.iter().flatten() {
            self.mark_object(GcId::Table(*mt), ctx.pool);
        }
        let finalizing = self.finalizing.clone();
        for id in finalizing {
            self.mark_object(id, ctx.pool);
        }
    }

    // ============ Marking ============

    fn mark_value(&mut self, v: &VelaValue, pool: &mut ObjectPool) {
        if let Some(id) = v.gc_id() {
            self.mark_object(id, pool);
        }
    }

    /// White objects become gray and queue for traversal; leaves go
    /// straight to black.
    fn mark_object(&mut self, id: GcId, pool: &mut ObjectPool) {
        let Some(h) = pool.header_mut(id) else {
            return;
        };
        if !h.is_white() {
            return;
        }
        match id {
            GcId::Str(_) => h.make_black(),
            _ => {
                h.make_gray();
                self.gray.push(id);
            }
        }
    }

    /// Pop one gray object, scan its references, return the work done.
    fn propagate_mark(&mut self, ctx: &mut GcCtx) -> isize {
        let Some(id) = self.gray.pop() else {
            return 0;
        };
        self.traverse(id, ctx)
    }

    fn propagate_all(&mut self, ctx: &mut GcCtx) -> isize {
        let mut work = 0;
        while !self.gray.is_empty() {
            work += self.propagate_mark(ctx);
        }
        work
    }

    fn traverse(&mut self, id: GcId, ctx: &mut GcCtx) -> isize {
        let size = ctx.pool.header(id).map(|h| h.size as isize).unwrap_or(0);
        match id {
            GcId::Table(tid) => self.traverse_table(tid, ctx),
            GcId::Closure(cid) => self.traverse_closure(cid, ctx),
            GcId::Upval(uid) => self.traverse_upval(uid, ctx),
            GcId::Userdata(uid) => self.traverse_userdata(uid, ctx),
            GcId::Thread(tid) => self.traverse_thread(tid, ctx),
            GcId::Str(sid) => {
                if let Some(h) = ctx.pool.strings.get_mut(sid.0) {
                    h.header.make_black();
                }
            }
        }
        size
    }

    /// Weak-mode of a table, read from its metatable's `__mode` field:
    /// 'k' for weak keys, 'v' for weak values.
    fn table_weakness(&self, tid: TableId, ctx: &GcCtx) -> (bool, bool) {
        let Some(mode_str) = ctx.mode_str else {
            return (false, false);
        };
        let Some(t) = ctx.pool.tables.get(tid.0) else {
            return (false, false);
        };
        let Some(mt) = t.data.metatable else {
            return (false, false);
        };
        let Some(mt_table) = ctx.pool.tables.get(mt.0) else {
            return (false, false);
        };
        let strs = Strings { pool: &ctx.pool.strings, hasher: ctx.strt.hasher() };
        let mode_key = VelaValue::string(mode_str, true);
        let mode_val = mt_table.data.get(&strs, &mode_key);
        let Some(sid) = mode_val.as_str_id() else {
            return (false, false);
        };
        match ctx.pool.strings.get(sid.0) {
            Some(s) => {
                let m = s.data.as_str();
                (m.contains('k'), m.contains('v'))
            }
            None => (false, false),
        }
    }

    fn traverse_table(&mut self, tid: TableId, ctx: &mut GcCtx) {
        let (weak_key, weak_value) = self.table_weakness(tid, ctx);
        let metatable = ctx.pool.tables.get(tid.0).and_then(|t| t.data.metatable);
        if let Some(h) = ctx.pool.tables.get_mut(tid.0) {
            h.header.make_black();
        } else {
            return;
        }
        if let Some(mt) = metatable {
            self.mark_object(GcId::Table(mt), ctx.pool);
        }
        if !weak_key && !weak_value {
            self.traverse_strong_table(tid, ctx);
        } else {
            // weak tables stay gray until the atomic clearing passes
            if let Some(h) = ctx.pool.tables.get_mut(tid.0) {
                h.header.make_gray();
            }
            if !weak_key {
                self.traverse_weak_value(tid, ctx);
            } else if !weak_value {
                self.traverse_ephemeron(tid, ctx);
            } else {
                self.allweak.push(tid);
            }
        }
    }

    fn traverse_strong_table(&mut self, tid: TableId, ctx: &mut GcCtx) {
        let mut to_mark = Vec::new();
        {
            let Some(t) = ctx.pool.tables.get_mut(tid.0) else {
                return;
            };
            for v in t.data.array_slots() {
                if v.is_collectable() {
                    to_mark.push(*v);
                }
            }
            for n in t.data.nodes_mut() {
                if n.val.is_nil() {
                    // entry is invisible: keep the slot, kill the key
                    if n.key.is_collectable() {
                        n.key.make_dead_key();
                    }
                } else {
                    if n.key.is_collectable() {
                        to_mark.push(n.key);
                    }
                    if n.val.is_collectable() {
                        to_mark.push(n.val);
                    }
                }
            }
        }
        for v in &to_mark {
            self.mark_value(v, ctx.pool);
        }
    }

    /// Weak values: keys are strong, values wait for the clearing pass.
    fn traverse_weak_value(&mut self, tid: TableId, ctx: &mut GcCtx) {
        let mut to_mark = Vec::new();
        {
            let Some(t) = ctx.pool.tables.get_mut(tid.0) else {
                return;
            };
            for n in t.data.nodes_mut() {
                if n.val.is_nil() {
                    if n.key.is_collectable() {
                        n.key.make_dead_key();
                    }
                } else if n.key.is_collectable() {
                    to_mark.push(n.key);
                }
            }
        }
        for v in &to_mark {
            self.mark_value(v, ctx.pool);
        }
        if self.state == GcState::Propagate && !self.atomic_phase {
            self.grayagain.push(GcId::Table(tid));
        } else {
            self.weak.push(tid);
        }
    }

    /// Ephemeron pass: a value is marked only once its key is known
    /// reachable. Returns whether anything new was marked.
    fn traverse_ephemeron(&mut self, tid: TableId, ctx: &mut GcCtx) -> bool {
        let mut marked = false;
        let mut has_clears = false; // some key still unreached
        let mut has_ww = false; // white key with white value

        let (array_len, node_len) = match ctx.pool.tables.get(tid.0) {
            Some(t) => (t.data.array_slots().len(), t.data.nodes().len()),
            None => return false,
        };
        // integer keys are always reachable, so array values are strong
        for i in 0..array_len {
            let v = match ctx.pool.tables.get(tid.0) {
                Some(t) => t.data.array_slots()[i],
                None => return marked,
            };
            if self.value_is_white(&v, ctx.pool) {
                marked = true;
                self.mark_value(&v, ctx.pool);
            }
        }
        for i in 0..node_len {
            let (k, v) = match ctx.pool.tables.get(tid.0) {
                Some(t) => (t.data.nodes()[i].key, t.data.nodes()[i].val),
                None => return marked,
            };
            if v.is_nil() {
                if let Some(t) = ctx.pool.tables.get_mut(tid.0) {
                    let n = &mut t.data.nodes_mut()[i];
                    if n.key.is_collectable() {
                        n.key.make_dead_key();
                    }
                }
            } else if self.is_cleared(&k, ctx.pool) {
                has_clears = true;
                if self.value_is_white(&v, ctx.pool) {
                    has_ww = true;
                }
            } else if self.value_is_white(&v, ctx.pool) {
                marked = true;
                self.mark_value(&v, ctx.pool);
            }
        }
        if self.state == GcState::Propagate && !self.atomic_phase {
            self.grayagain.push(GcId::Table(tid));
        } else if has_ww {
            self.ephemeron.push(tid); // must converge again
        } else if has_clears {
            self.allweak.push(tid); // only white keys left to clear
        }
        marked
    }

    fn traverse_closure(&mut self, cid: ClosureId, ctx: &mut GcCtx) {
        enum Refs {
            Native(Vec<VelaValue>),
            Script(std::rc::Rc<Proto>, Vec<UpvalId>),
        }
        let refs = {
            let Some(c) = ctx.pool.closures.get_mut(cid.0) else {
                return;
            };
            c.header.make_black();
            match &c.data {
                VelaClosure::Native { upvals, .. } => Refs::Native(upvals.clone()),
                VelaClosure::Script { proto, upvals } => {
                    Refs::Script(proto.clone(), upvals.clone())
                }
            }
        };
        match refs {
            Refs::Native(upvals) => {
                for v in &upvals {
                    self.mark_value(v, ctx.pool);
                }
            }
            Refs::Script(proto, upvals) => {
                self.mark_proto(&proto, ctx.pool);
                for uid in upvals {
                    self.mark_object(GcId::Upval(uid), ctx.pool);
                }
            }
        }
    }

    fn mark_proto(&mut self, proto: &Proto, pool: &mut ObjectPool) {
        for k in &proto.constants {
            self.mark_value(k, pool);
        }
        for child in &proto.protos {
            self.mark_proto(child, pool);
        }
    }

    fn traverse_upval(&mut self, uid: UpvalId, ctx: &mut GcCtx) {
        let value = {
            let Some(u) = ctx.pool.upvals.get_mut(uid.0) else {
                return;
            };
            u.header.make_black();
            match &mut u.data.state {
                UpvalState::Closed(v) => Some(*v),
                UpvalState::Open { thread, level, touched } => {
                    // the live value sits on the owner's stack; during
                    // the atomic remark it is marked through here, and
                    // before that `touched` keeps it visible to
                    // remark_upvals should the owning thread die
                    if self.atomic_phase {
                        ctx.pool
                            .threads
                            .get(thread.0)
                            .and_then(|t| t.data.stack.get(*level).copied())
                    } else {
                        *touched = true;
                        None
                    }
                }
            }
        };
        if let Some(v) = value {
            self.mark_value(&v, ctx.pool);
        }
    }

    fn traverse_userdata(&mut self, uid: UserdataId, ctx: &mut GcCtx) {
        let metatable = {
            let Some(u) = ctx.pool.userdata.get_mut(uid.0) else {
                return;
            };
            u.header.make_black();
            u.data.metatable
        };
        if let Some(mt) = metatable {
            self.mark_object(GcId::Table(mt), ctx.pool);
        }
    }

    fn traverse_thread(&mut self, tid: ThreadId, ctx: &mut GcCtx) {
        let stack_values: Vec<VelaValue> = {
            let Some(t) = ctx.pool.threads.get_mut(tid.0) else {
                return;
            };
            t.header.make_black();
            t.data.stack[..t.data.top].to_vec()
        };
        for v in &stack_values {
            self.mark_value(v, ctx.pool);
        }
        if !self.atomic_phase {
            // threads are revisited atomically: the mutator keeps
            // writing to their stacks without barriers
            if let Some(t) = ctx.pool.threads.get_mut(tid.0) {
                t.header.make_gray();
            }
            self.grayagain.push(GcId::Thread(tid));
        }
    }

    #[inline]
    fn value_is_white(&self, v: &VelaValue, pool: &ObjectPool) -> bool {
        match v.gc_id() {
            Some(id) => pool.header(id).map(|h| h.is_white()).unwrap_or(false),
            None => false,
        }
    }

    /// Is this table entry slot about to be cleared? Strings behave as
    /// plain values here: a string key keeps its entry alive.
    fn is_cleared(&mut self, v: &VelaValue, pool: &mut ObjectPool) -> bool {
        match v.gc_id() {
            None => false,
            Some(GcId::Str(sid)) => {
                if let Some(s) = pool.strings.get_mut(sid.0) {
                    if s.header.is_white() {
                        s.header.make_black();
                    }
                }
                false
            }
            Some(id) => pool.header(id).map(|h| h.is_white()).unwrap_or(false),
        }
    }

    // ============ Atomic phase ============

    fn atomic(&mut self, ctx: &mut GcCtx) -> isize {
        self.atomic_phase = true;
        let mut work = 0;

        self.mark_roots(ctx);
        self.remark_upvals(ctx);
        work += self.propagate_all(ctx);

        // objects dirtied by barriers, threads, weak tables seen mid-cycle
        let grayagain = std::mem::take(&mut self.grayagain);
        self.gray.extend(grayagain);
        work += self.propagate_all(ctx);

        work += self.converge_ephemerons(ctx);
        // all strongly accessible objects are marked now
        self.clear_values(&self.weak.clone(), ctx);
        self.clear_values(&self.allweak.clone(), ctx);
        let orig_weak = self.weak.len();
        let orig_allweak = self.allweak.len();

        self.separate_tobefnz(ctx);
        self.mark_being_finalized(ctx);
        work += self.propagate_all(ctx);
        work += self.converge_ephemerons(ctx);
        // resurrection may have re-grown the weak lists
        self.clear_keys(&self.ephemeron.clone(), ctx);
        self.clear_keys(&self.allweak.clone(), ctx);
        let new_weak: Vec<TableId> = self.weak[orig_weak..].to_vec();
        let new_allweak: Vec<TableId> = self.allweak[orig_allweak..].to_vec();
        self.clear_values(&new_weak, ctx);
        self.clear_values(&new_allweak, ctx);

        ctx.strt.clear_cache();
        self.current_white ^= 1;
        self.atomic_phase = false;
        work
    }

    fn converge_ephemerons(&mut self, ctx: &mut GcCtx) -> isize {
        let mut work = 0;
        let mut rounds = 0;
        loop {
            let mut changed = false;
            let list = std::mem::take(&mut self.ephemeron);
            for tid in list {
                if self.traverse_ephemeron(tid, ctx) {
                    work += self.propagate_all(ctx);
                    changed = true;
                }
            }
            rounds += 1;
            if !changed {
                break;
            }
            if rounds >= MAX_EPHEMERON_ROUNDS {
                warn!(target: "velars::gc", "ephemeron convergence hit the round cap");
                break;
            }
        }
        work
    }

    /// Clear entries whose value is unreachable (value-weak tables).
    fn clear_values(&mut self, list: &[TableId], ctx: &mut GcCtx) {
        for &tid in list {
            let (array_len, node_len) = match ctx.pool.tables.get(tid.0) {
                Some(t) => (t.data.array_slots().len(), t.data.nodes().len()),
                None => continue,
            };
            for i in 0..array_len {
                let v = match ctx.pool.tables.get(tid.0) {
                    Some(t) => t.data.array_slots()[i],
                    None => break,
                };
                if self.is_cleared(&v, ctx.pool) {
                    if let Some(t) = ctx.pool.tables.get_mut(tid.0) {
                        t.data.array_slots_mut()[i] = VelaValue::nil();
                    }
                }
            }
            for i in 0..node_len {
                let v = match ctx.pool.tables.get(tid.0) {
                    Some(t) => t.data.nodes()[i].val,
                    None => break,
                };
                if !v.is_nil() && self.is_cleared(&v, ctx.pool) {
                    if let Some(t) = ctx.pool.tables.get_mut(tid.0) {
                        t.data.nodes_mut()[i].val = VelaValue::nil();
                    }
                }
                if let Some(t) = ctx.pool.tables.get_mut(tid.0) {
                    let n = &mut t.data.nodes_mut()[i];
                    if n.val.is_nil() && n.key.is_collectable() {
                        n.key.make_dead_key();
                    }
                }
            }
        }
    }

    /// Clear entries whose key is unreachable (key-weak tables).
    fn clear_keys(&mut self, list: &[TableId], ctx: &mut GcCtx) {
        for &tid in list {
            let node_len = match ctx.pool.tables.get(tid.0) {
                Some(t) => t.data.nodes().len(),
                None => continue,
            };
            for i in 0..node_len {
                let (k, v) = match ctx.pool.tables.get(tid.0) {
                    Some(t) => (t.data.nodes()[i].key, t.data.nodes()[i].val),
                    None => break,
                };
                if !v.is_nil() && self.is_cleared(&k, ctx.pool) {
                    if let Some(t) = ctx.pool.tables.get_mut(tid.0) {
                        t.data.nodes_mut()[i].val = VelaValue::nil();
                    }
                }
                if let Some(t) = ctx.pool.tables.get_mut(tid.0) {
                    let n = &mut t.data.nodes_mut()[i];
                    if n.val.is_nil() && n.key.is_collectable() {
                        n.key.make_dead_key();
                    }
                }
            }
        }
    }

    /// Break open-upvalue cycles through dead coroutines: threads that
    /// are no longer reachable leave `twups`; the values of their
    /// touched upvalues get one final remark.
    fn remark_upvals(&mut self, ctx: &mut GcCtx) {
        let twups = std::mem::take(&mut self.twups);
        let mut to_mark = Vec::new();
        for tid in twups {
            let Some(t) = ctx.pool.threads.get_mut(tid.0) else {
                continue;
            };
            let alive = !t.header.is_white();
            let has_upvals = !t.data.open_upvals.is_empty();
            if alive && has_upvals {
                self.twups.push(tid);
            }
            let upvals = t.data.open_upvals.clone();
            let keep = alive && has_upvals;
            for uid in upvals {
                let value = {
                    let Some(u) = ctx.pool.upvals.get_mut(uid.0) else {
                        continue;
                    };
                    match &mut u.data.state {
                        UpvalState::Open { level, touched, .. } => {
                            let was_touched = *touched;
                            *touched = false;
                            if !keep && was_touched {
                                ctx.pool
                                    .threads
                                    .get(tid.0)
                                    .and_then(|t| t.data.stack.get(*level).copied())
                            } else {
                                None
                            }
                        }
                        UpvalState::Closed(_) => None,
                    }
                };
                if let Some(v) = value {
                    to_mark.push(v);
                }
            }
        }
        for v in &to_mark {
            self.mark_value(v, ctx.pool);
        }
    }

    /// Move unreachable finalizable objects to the to-be-finalized
    /// queue and resurrect them so the finalizer sees a live object.
    fn separate_tobefnz(&mut self, ctx: &mut GcCtx) {
        let finobj = std::mem::take(&mut self.finobj);
        for id in finobj {
            let white = ctx
                .pool
                .header(id)
                .map(|h| h.is_white() && !h.is_fixed())
                .unwrap_or(false);
            if white {
                self.tobefnz.push(id);
            } else {
                self.finobj.push(id);
            }
        }
    }

    fn mark_being_finalized(&mut self, ctx: &mut GcCtx) {
        let tobefnz = self.tobefnz.clone();
        for id in tobefnz {
            self.mark_object(id, ctx.pool);
        }
    }

    // ============ Sweeping ============

    fn enter_sweep(&mut self) {
        self.state = GcState::SwpAllGc;
        self.begin_sweep(ListKind::Allgc);
    }

    fn begin_sweep(&mut self, _kind: ListKind) {
        self.sweep_read = 0;
        self.sweep_write = 0;
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<GcId> {
        match kind {
            ListKind::Allgc => &mut self.allgc,
            ListKind::Finobj => &mut self.finobj,
            ListKind::Tobefnz => &mut self.tobefnz,
        }
    }

    fn sweep_done(&mut self, kind: ListKind) -> bool {
        let read = self.sweep_read;
        let write = self.sweep_write;
        let list = self.list_mut(kind);
        if read >= list.len() {
            list.truncate(write);
            true
        } else {
            false
        }
    }

    /// Sweep a bounded slice: free objects still carrying the old
    /// white, flip survivors to the new white, compact in place.
    fn sweep_step(&mut self, kind: ListKind, ctx: &mut GcCtx, max: usize) -> isize {
        let other = GcHeader::other_white(self.current_white);
        let cw = self.current_white;
        let mut list = std::mem::take(self.list_mut(kind));
        let mut read = self.sweep_read;
        let mut write = self.sweep_write;
        let end = read.saturating_add(max).min(list.len());
        let mut freed: isize = 0;
        while read < end {
            let id = list[read];
            let dead = ctx
                .pool
                .header(id)
                .map(|h| !h.is_fixed() && h.is_dead(other))
                .unwrap_or(false);
            if dead {
                freed += self.free_object(id, ctx) as isize;
            } else {
                if let Some(h) = ctx.pool.header_mut(id) {
                    h.make_white(cw);
                }
                list[write] = id;
                write += 1;
            }
            read += 1;
        }
        self.sweep_read = read;
        self.sweep_write = write;
        *self.list_mut(kind) = list;
        freed.max(1)
    }

    /// Complete the sweep of `allgc` immediately; list surgery (e.g.
    /// attaching a finalizer) needs stable positions.
    pub(crate) fn finish_allgc_sweep(&mut self, ctx: &mut GcCtx) {
        if self.state != GcState::SwpAllGc {
            return;
        }
        while !self.sweep_done(ListKind::Allgc) {
            self.sweep_step(ListKind::Allgc, ctx, usize::MAX);
        }
        self.begin_sweep(ListKind::Finobj);
        self.state = GcState::SwpFinObj;
    }

    /// Free one object, running kind-specific teardown. Returns the
    /// bytes released.
    pub(crate) fn free_object(&mut self, id: GcId, ctx: &mut GcCtx) -> usize {
        let size = match id {
            GcId::Str(sid) => match ctx.pool.strings.free(sid.0) {
                Some(obj) => {
                    if obj.data.is_short() {
                        ctx.strt.remove(sid, obj.data.stored_hash());
                    }
                    obj.header.size as usize
                }
                None => 0,
            },
            GcId::Table(tid) => ctx
                .pool
                .tables
                .free(tid.0)
                .map(|o| o.header.size as usize)
                .unwrap_or(0),
            GcId::Closure(cid) => match ctx.pool.closures.free(cid.0) {
                Some(obj) => {
                    if let VelaClosure::Script { upvals, .. } = &obj.data {
                        for uid in upvals {
                            if let Some(u) = ctx.pool.upvals.get_mut(uid.0) {
                                u.data.refcount = u.data.refcount.saturating_sub(1);
                            }
                        }
                    }
                    obj.header.size as usize
                }
                None => 0,
            },
            GcId::Upval(uid) => match ctx.pool.upvals.free(uid.0) {
                Some(obj) => {
                    if let UpvalState::Open { thread, .. } = &obj.data.state {
                        if let Some(t) = ctx.pool.threads.get_mut(thread.0) {
                            t.data.open_upvals.retain(|&u| u != uid);
                        }
                    }
                    obj.header.size as usize
                }
                None => 0,
            },
            GcId::Userdata(uid) => ctx
                .pool
                .userdata
                .free(uid.0)
                .map(|o| o.header.size as usize)
                .unwrap_or(0),
            GcId::Thread(tid) => match ctx.pool.threads.free(tid.0) {
                Some(obj) => {
                    // close the dying thread's upvalues over its stack
                    for uid in &obj.data.open_upvals {
                        if let Some(u) = ctx.pool.upvals.get_mut(uid.0) {
                            if let UpvalState::Open { level, .. } = u.data.state {
                                let v = obj
                                    .data
                                    .stack
                                    .get(level)
                                    .copied()
                                    .unwrap_or(VelaValue::nil());
                                u.data.close(v);
                            }
                        }
                    }
                    self.twups.retain(|&t| t != tid);
                    obj.header.size as usize
                }
                None => 0,
            },
        };
        if size > 0 {
            ctx.alloc.realloc(size, 0);
            self.total_bytes = self.total_bytes.saturating_sub(size);
            self.debt -= size as isize;
            self.stats.objects_collected += 1;
            self.stats.bytes_freed += size;
        }
        size
    }

    // ============ Write barriers ============

    /// Forward barrier: a black object now references a white one; mark
    /// the sink at once (or, during sweep, whiten the source so the
    /// barrier does not keep firing).
    pub(crate) fn barrier_forward(&mut self, o: GcId, v: GcId, pool: &mut ObjectPool) {
        let o_black = pool.header(o).map(|h| h.is_black()).unwrap_or(false);
        let v_white = pool.header(v).map(|h| h.is_white()).unwrap_or(false);
        if !o_black || !v_white {
            return;
        }
        if self.keep_invariant() {
            self.mark_object(v, pool);
        } else if self.is_sweep_phase() {
            if let Some(h) = pool.header_mut(o) {
                h.make_white(self.current_white);
            }
        }
    }

    /// Back barrier for containers that absorb many writes: revert the
    /// black container to gray and revisit it atomically.
    pub(crate) fn barrier_back(&mut self, tid: TableId, pool: &mut ObjectPool) {
        let Some(t) = pool.tables.get_mut(tid.0) else {
            return;
        };
        if !t.header.is_black() {
            return;
        }
        t.header.make_gray();
        self.grayagain.push(GcId::Table(tid));
    }

    /// A closing upvalue inlines a stack value; while marking runs the
    /// value must survive even if the upvalue is already black.
    pub(crate) fn barrier_upval_close(&mut self, value: &VelaValue, pool: &mut ObjectPool) {
        if self.keep_invariant() {
            self.mark_value(value, pool);
        }
    }

    // ============ List management ============

    /// Every new object joins `allgc`.
    #[inline]
    pub(crate) fn link_allgc(&mut self, id: GcId) {
        self.allgc.push(id);
    }

    /// Pin an object forever (fundamental strings, the main thread).
    /// The object must be fresh, still in `allgc`'s tail or unlisted.
    pub(crate) fn fix_object(&mut self, id: GcId, pool: &mut ObjectPool) {
        if let Some(pos) = self.allgc.iter().rposition(|&x| x == id) {
            self.allgc.remove(pos);
        }
        if let Some(h) = pool.header_mut(id) {
            h.set_fixed();
            h.make_gray(); // fixed objects are never collected nor marked
        }
        self.fixedgc.push(id);
    }

    /// Move an object with a fresh finalizer from `allgc` to `finobj`.
    /// The caller has already ensured `allgc` is not mid-sweep.
    pub(crate) fn move_to_finobj(&mut self, id: GcId, pool: &mut ObjectPool) {
        let Some(h) = pool.header_mut(id) else {
            return;
        };
        if h.is_finalized() || h.is_fixed() {
            return;
        }
        h.set_finalized();
        if let Some(pos) = self.allgc.iter().position(|&x| x == id) {
            self.allgc.remove(pos);
            self.finobj.push(id);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Allgc,
    Finobj,
    Tobefnz,
}
