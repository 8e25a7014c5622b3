pub mod closure;
pub mod table;
pub mod upvalue;
pub mod value;

pub use closure::{NativeFn, Proto, VelaClosure, VelaUserdata, MAX_UPVALS};
pub use table::VelaTable;
pub use upvalue::{UpvalState, VelaUpvalue};
pub use value::*;
