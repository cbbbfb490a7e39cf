//! Executable plugin code embedded in a plugin record.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Magic prefix of every binary wasm module.
pub const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// A plugin's entry module: WebAssembly text or a compiled binary module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    Text(String),
    Binary(Vec<u8>),
}

impl EntrySource {
    /// Classifies raw entry bytes read from an archive.
    /// Returns `None` when the bytes are neither a wasm module nor UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.starts_with(WASM_MAGIC) {
            return Some(Self::Binary(bytes));
        }
        String::from_utf8(bytes).ok().map(Self::Text)
    }

    /// Bytes handed to the wasm compiler (text is accepted as `.wat`).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum EntrySourceRepr {
    Text(String),
    Binary { base64: String },
}

impl Serialize for EntrySource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Self::Text(text) => EntrySourceRepr::Text(text.clone()),
            Self::Binary(bytes) => EntrySourceRepr::Binary {
                base64: STANDARD.encode(bytes),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntrySource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match EntrySourceRepr::deserialize(deserializer)? {
            EntrySourceRepr::Text(text) => Ok(Self::Text(text)),
            EntrySourceRepr::Binary { base64 } => STANDARD
                .decode(base64.as_bytes())
                .map(Self::Binary)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_wasm_and_text() {
        let wasm = b"\0asm\x01\0\0\0".to_vec();
        assert_eq!(EntrySource::from_bytes(wasm.clone()), Some(EntrySource::Binary(wasm)));
        assert_eq!(
            EntrySource::from_bytes(b"(module)".to_vec()),
            Some(EntrySource::Text("(module)".into()))
        );
        assert_eq!(EntrySource::from_bytes(vec![0xff, 0xfe, 0x00]), None);
    }

    #[test]
    fn text_serializes_as_plain_string() {
        let json = serde_json::to_string(&EntrySource::Text("(module)".into())).unwrap();
        assert_eq!(json, r#""(module)""#);
    }

    #[test]
    fn binary_serializes_as_base64_object() {
        let entry = EntrySource::Binary(b"\0asm\x01\0\0\0".to_vec());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["base64"], "AGFzbQEAAAA=");
        let back: EntrySource = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
