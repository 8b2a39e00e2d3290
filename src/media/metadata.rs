//! `onMetaData` handling
//!
//! Publishers send `@setDataFrame onMetaData {...}`; recorders keep the
//! descriptive fields and write their own script tag with a patchable
//! `duration`.

use bytes::Bytes;

use crate::amf::{self, AmfValue};

const SET_DATA_FRAME: &str = "@setDataFrame";
const ON_METADATA: &str = "onMetaData";

/// Descriptive stream fields taken from the publisher's metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetadata {
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub framerate: Option<f64>,
    pub videocodecid: Option<f64>,
    pub audiocodecid: Option<f64>,
    pub encoder: Option<String>,
}

impl StreamMetadata {
    /// Parse a script tag body; `None` unless it carries `onMetaData`
    pub fn from_script(body: &Bytes) -> Option<Self> {
        let values = amf::decode_all(body).ok()?;
        let mut iter = values.iter().peekable();
        if iter.peek().and_then(|v| v.as_str()) == Some(SET_DATA_FRAME) {
            iter.next();
        }
        if iter.next()?.as_str()? != ON_METADATA {
            return None;
        }
        let props = iter.next()?;
        props.as_properties()?;

        let number = |key: &str| props.get(key).and_then(AmfValue::as_number);
        Some(Self {
            width: number("width"),
            height: number("height"),
            framerate: number("framerate").or_else(|| number("fps")),
            videocodecid: number("videocodecid"),
            audiocodecid: number("audiocodecid"),
            encoder: props
                .get("encoder")
                .and_then(AmfValue::as_str)
                .map(str::to_string),
        })
    }

    /// Fill codec ids the publisher did not announce
    pub fn with_codecs(mut self, video: Option<u8>, audio: Option<u8>) -> Self {
        if self.videocodecid.is_none() {
            self.videocodecid = video.map(f64::from);
        }
        if self.audiocodecid.is_none() {
            self.audiocodecid = audio.map(f64::from);
        }
        self
    }

    /// Picture size for sample entries, 0 when unknown
    pub fn dimensions(&self) -> (u16, u16) {
        let clamp = |v: Option<f64>| v.map(|v| v.clamp(0.0, u16::MAX as f64) as u16).unwrap_or(0);
        (clamp(self.width), clamp(self.height))
    }

    /// Encode `onMetaData` with `duration` first.
    ///
    /// Returns the body and the offset of the 8-byte duration value.
    pub fn to_script(&self, duration_secs: f64) -> (Bytes, usize) {
        let mut props: Vec<(String, AmfValue)> = vec![("duration".into(), duration_secs.into())];
        let fields = [
            ("width", self.width),
            ("height", self.height),
            ("framerate", self.framerate),
            ("videocodecid", self.videocodecid),
            ("audiocodecid", self.audiocodecid),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                props.push((key.into(), v.into()));
            }
        }
        if let Some(encoder) = &self.encoder {
            props.push(("encoder".into(), encoder.as_str().into()));
        }

        let body = amf::encode_all(&[ON_METADATA.into(), AmfValue::EcmaArray(props)]);
        // name (1 + 2 + 10), ECMA marker + count (5), key (2 + 8), number marker
        let offset = 13 + 5 + 10 + 1;
        (body, offset)
    }
}
