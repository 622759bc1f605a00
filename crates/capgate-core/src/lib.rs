pub mod capability;
pub mod frame;
pub mod naming;
pub mod pattern;

pub use capability::{CapabilityError, CapabilitySet, CURRENT_CAPABILITY_VERSION};
pub use frame::{
    decode_client_frame, decode_frame, encode_frame, payload_value, ClientFrame, ClientOp,
    FrameError, JsSubOptions, KvSubOptions, ServerFrame, ServerOp, DEFAULT_MAX_FRAME_BYTES,
};
pub use naming::durable_name;
pub use pattern::{covered_by_any, matches_any, pattern_covers, subject_match};
