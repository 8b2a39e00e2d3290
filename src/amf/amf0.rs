//! AMF0 encoder and decoder
//!
//! Type markers handled:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! 0x0D - Unsupported
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;

const MAX_NESTING_DEPTH: usize = 32;

/// AMF0 decoder over one script tag body
pub struct Amf0Decoder {
    buf: Bytes,
    start_len: usize,
    depth: usize,
    /// Offsets of top-level property numbers, recorded when requested
    watch: Option<(String, Option<usize>)>,
}

impl Amf0Decoder {
    pub fn new(data: Bytes) -> Self {
        Self {
            start_len: data.len(),
            buf: data,
            depth: 0,
            watch: None,
        }
    }

    fn position(&self) -> usize {
        self.start_len - self.buf.remaining()
    }

    /// Decode a single value
    pub fn decode(&mut self) -> Result<AmfValue, AmfError> {
        if !self.buf.has_remaining() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(AmfError::NestingTooDeep);
        }
        let marker = self.buf.get_u8();
        let result = self.decode_value(marker);
        self.depth -= 1;
        result
    }

    /// Decode values until the buffer is exhausted
    pub fn decode_all(&mut self) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while self.buf.has_remaining() {
            values.push(self.decode()?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                self.need(8)?;
                Ok(AmfValue::Number(self.buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                self.need(1)?;
                Ok(AmfValue::Boolean(self.buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(self.read_utf8()?)),
            MARKER_LONG_STRING => {
                self.need(4)?;
                let len = self.buf.get_u32() as usize;
                Ok(AmfValue::String(self.read_str(len)?))
            }
            MARKER_OBJECT => Ok(AmfValue::Object(self.read_properties()?)),
            MARKER_ECMA_ARRAY => {
                self.need(4)?;
                // advisory count, the end marker terminates
                self.buf.advance(4);
                Ok(AmfValue::EcmaArray(self.read_properties()?))
            }
            MARKER_STRICT_ARRAY => {
                self.need(4)?;
                let count = self.buf.get_u32() as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.decode()?);
                }
                Ok(AmfValue::StrictArray(items))
            }
            MARKER_DATE => {
                self.need(10)?;
                let millis = self.buf.get_f64();
                self.buf.advance(2); // timezone, unused
                Ok(AmfValue::Date(millis))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            other => Err(AmfError::UnknownMarker(other)),
        }
    }

    fn read_properties(&mut self) -> Result<Vec<(String, AmfValue)>, AmfError> {
        let mut props = Vec::new();
        loop {
            let key = self.read_utf8()?;
            if key.is_empty() {
                // Some encoders drop the end marker at the end of the tag
                if self.buf.has_remaining() && self.buf[0] == MARKER_OBJECT_END {
                    self.buf.advance(1);
                }
                break;
            }

            if self.depth == 1 {
                if let Some((watched, slot)) = self.watch.as_mut() {
                    let at_number = self.buf.first() == Some(&MARKER_NUMBER);
                    if *watched == key && at_number {
                        *slot = Some(self.start_len - self.buf.remaining() + 1);
                    }
                }
            }

            let value = self.decode()?;
            props.push((key, value));
        }
        Ok(props)
    }

    fn need(&self, n: usize) -> Result<(), AmfError> {
        if self.buf.remaining() < n {
            Err(AmfError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    fn read_utf8(&mut self) -> Result<String, AmfError> {
        self.need(2)?;
        let len = self.buf.get_u16() as usize;
        self.read_str(len)
    }

    fn read_str(&mut self, len: usize) -> Result<String, AmfError> {
        self.need(len)?;
        let raw = self.buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
    }
}

/// Byte offset of the 8-byte number stored under `key` in the object that
/// follows the script name (e.g. `duration` in `onMetaData`)
pub fn locate_number(data: &Bytes, key: &str) -> Option<usize> {
    let mut decoder = Amf0Decoder::new(data.clone());
    decoder.watch = Some((key.to_string(), None));
    decoder.decode().ok()?;
    decoder.decode().ok()?;
    let offset = decoder.watch.take().and_then(|(_, slot)| slot)?;
    debug_assert!(offset + 8 <= decoder.position());
    Some(offset)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes, leaving the encoder empty
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(*b as u8);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::StrictArray(items) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(items.len() as u32);
                for item in items {
                    self.encode(item);
                }
            }
            AmfValue::Date(millis) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(0);
            }
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
        }
    }

    fn write_properties(&mut self, props: &[(String, AmfValue)]) {
        for (key, value) in props {
            let len = key.len().min(0xFFFF);
            self.buf.put_u16(len as u16);
            self.buf.put_slice(&key.as_bytes()[..len]);
            self.encode(value);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a sequence of values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    for value in values {
        encoder.encode(value);
    }
    encoder.finish()
}

/// Decode every value in `data`
pub fn decode_all(data: &Bytes) -> Result<Vec<AmfValue>, AmfError> {
    Amf0Decoder::new(data.clone()).decode_all()
}
