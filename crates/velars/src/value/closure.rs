// Closures, prototypes and full userdata.

use std::any::Any;
use std::rc::Rc;

use crate::gc::{TableId, ThreadId, UpvalId};
use crate::value::VelaValue;
use crate::vm::{VelaResult, VelaVM};

/// Native function callable from the runtime. Receives the owning state
/// and the thread whose stack carries the arguments; returns the number
/// of results left on that stack.
pub type NativeFn = fn(&mut VelaVM, ThreadId) -> VelaResult<usize>;

/// Function prototype produced by an external compiler. Only the parts
/// the runtime core needs are modeled: constants feed the collector,
/// `nupvals` drives closure initialization.
pub struct Proto {
    pub nparams: u8,
    pub is_vararg: bool,
    pub nupvals: u8,
    pub constants: Vec<VelaValue>,
    /// Prototypes of nested functions
    pub protos: Vec<Rc<Proto>>,
}

impl Proto {
    pub fn new(nparams: u8, nupvals: u8) -> Self {
        Proto {
            nparams,
            is_vararg: false,
            nupvals,
            constants: Vec::new(),
            protos: Vec::new(),
        }
    }
}

/// Maximum number of upvalues in a closure.
pub const MAX_UPVALS: usize = 255;

/// A closure is either native (captures values directly) or scripted
/// (captures shared upvalue cells plus its prototype).
pub enum VelaClosure {
    Native {
        f: NativeFn,
        upvals: Vec<VelaValue>,
    },
    Script {
        proto: Rc<Proto>,
        upvals: Vec<UpvalId>,
    },
}

impl VelaClosure {
    #[inline]
    pub fn is_scripted(&self) -> bool {
        matches!(self, VelaClosure::Script { .. })
    }

    #[inline]
    pub fn native_fn(&self) -> Option<NativeFn> {
        match self {
            VelaClosure::Native { f, .. } => Some(*f),
            VelaClosure::Script { .. } => None,
        }
    }

    #[inline]
    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match self {
            VelaClosure::Script { proto, .. } => Some(proto),
            VelaClosure::Native { .. } => None,
        }
    }

    #[inline]
    pub fn script_upvals(&self) -> &[UpvalId] {
        match self {
            VelaClosure::Script { upvals, .. } => upvals,
            VelaClosure::Native { .. } => &[],
        }
    }
}

/// Full userdata: an embedder payload with an optional metatable.
pub struct VelaUserdata {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableId>,
}

impl VelaUserdata {
    pub fn new(data: Box<dyn Any>) -> Self {
        VelaUserdata { data, metatable: None }
    }
}
