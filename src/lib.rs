#[macro_use]
extern crate lazy_static;

pub(crate) mod default;
pub mod errors;
pub mod key_registry;
pub mod kv;
pub mod lsm;
pub mod options;
pub(crate) mod util;
pub mod vlog;

pub use crate::default::MOVE_KEY_PREFIX;
pub use crate::kv::{Entry, ValuePointer, ValueStruct};
pub use crate::options::Options;
pub use crate::vlog::header::MAX_HEADER_SIZE;
pub use crate::vlog::write::Request;
pub use crate::vlog::ValueLog;
