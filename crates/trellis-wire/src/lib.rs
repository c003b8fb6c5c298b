mod decode;
mod encode;
mod types;

pub use decode::{CommonHeaders, HeaderIter, Message, Prelude, decode_frame, decode_prelude};
pub use encode::encode_frame;
pub use types::{Header, HeaderValue, MessageFlags, MessageType, RequestType};

/// Maximum total frame length accepted on the bus and the gateway.
pub const MAX_FRAME_LEN: usize = 10000;

/// Prelude size: two big-endian u32 lengths plus the prelude CRC.
pub const PRELUDE_LEN: usize = 12;

/// Smallest well-formed frame: prelude plus trailing message CRC.
pub const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;
