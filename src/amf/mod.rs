//! AMF0 serialization for FLV script tags

pub mod amf0;
pub mod value;

pub use amf0::{decode_all, encode_all, locate_number, Amf0Decoder, Amf0Encoder};
pub use value::AmfValue;
