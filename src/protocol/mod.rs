//! Protocol layer: the binary frame format spoken on the wire.

pub mod frame;

pub use frame::{
    CONTROL_MARKER, Command, Frame, FrameBody, FrameHeader, HEADER_LEN, HeaderKind,
    MAX_PAYLOAD_LEN, VERSION, read_frame, read_header,
};
