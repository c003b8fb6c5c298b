mod codec;
mod fault;
mod object;

pub use codec::{MAX_OBJECT_DEPTH, decode, encode_into, encode_map_into};
pub use fault::Fault;
pub use object::{Kind, Map, Object};
