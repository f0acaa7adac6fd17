//! Minimal bencode encoder for messages and descriptors we produce.

use std::collections::BTreeMap;

/// Owned bencode value.
///
/// Dictionary keys are kept sorted so encoding is canonical, which matters
/// because info hashes are computed over encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Starts an empty dictionary.
    pub fn dictionary() -> Self {
        Self::Dictionary(BTreeMap::new())
    }

    /// Inserts `key` when `self` is a dictionary; other variants are unchanged.
    pub fn with(mut self, key: &str, value: impl Into<BencodeValue>) -> Self {
        if let Self::Dictionary(entries) = &mut self {
            entries.insert(key.as_bytes().to_vec(), value.into());
        }
        self
    }

    /// Appends the encoded form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Integer(value) => {
                out.push(b'i');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dictionary(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Encodes into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

impl From<i64> for BencodeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for BencodeValue {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(value: Vec<BencodeValue>) -> Self {
        Self::List(value)
    }
}

/// Wraps raw info dictionary bytes into a `.torrent` descriptor.
///
/// The info bytes are spliced in verbatim so the info hash is preserved.
pub fn encode_torrent_file(info_bytes: &[u8], announce_urls: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(info_bytes.len() + 64);
    out.push(b'd');
    if let Some(primary) = announce_urls.first() {
        BencodeValue::from("announce").encode_into(&mut out);
        BencodeValue::from(primary.as_str()).encode_into(&mut out);
        if announce_urls.len() > 1 {
            let tiers: Vec<BencodeValue> = announce_urls
                .iter()
                .map(|url| BencodeValue::List(vec![BencodeValue::from(url.as_str())]))
                .collect();
            BencodeValue::from("announce-list").encode_into(&mut out);
            BencodeValue::List(tiers).encode_into(&mut out);
        }
    }
    BencodeValue::from("info").encode_into(&mut out);
    out.extend_from_slice(info_bytes);
    out.push(b'e');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_keys_are_sorted() {
        let value = BencodeValue::dictionary()
            .with("z", 1i64)
            .with("a", "x")
            .with("m", vec![BencodeValue::from(2i64)]);
        assert_eq!(value.encode(), b"d1:a1:x1:mli2ee1:zi1ee".to_vec());
    }

    #[test]
    fn test_negative_integer() {
        assert_eq!(BencodeValue::from(-42i64).encode(), b"i-42e".to_vec());
    }
}
