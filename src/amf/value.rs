//! AMF0 value model
//!
//! Script tags only need the AMF0 subset. Object properties keep their
//! wire order so a re-encoded `onMetaData` looks like the one received.

/// AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// IEEE 754 double (0x00)
    Number(f64),
    /// Boolean (0x01)
    Boolean(bool),
    /// UTF-8 string (0x02 / 0x0C)
    String(String),
    /// Anonymous object (0x03)
    Object(Vec<(String, AmfValue)>),
    /// Null (0x05)
    Null,
    /// Undefined (0x06)
    Undefined,
    /// Associative array (0x08)
    EcmaArray(Vec<(String, AmfValue)>),
    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),
    /// Milliseconds since the Unix epoch (0x0B)
    Date(f64),
}

impl AmfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_properties(&self) -> Option<&[(String, AmfValue)]> {
        match self {
            AmfValue::Object(props) | AmfValue::EcmaArray(props) => Some(props),
            _ => None,
        }
    }

    /// Look up a property by name
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_properties()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

impl From<f64> for AmfValue {
    fn from(n: f64) -> Self {
        AmfValue::Number(n)
    }
}

impl From<bool> for AmfValue {
    fn from(b: bool) -> Self {
        AmfValue::Boolean(b)
    }
}

impl From<&str> for AmfValue {
    fn from(s: &str) -> Self {
        AmfValue::String(s.to_string())
    }
}

impl From<String> for AmfValue {
    fn from(s: String) -> Self {
        AmfValue::String(s)
    }
}
