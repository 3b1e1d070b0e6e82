//! AMF0 encoder and decoder
//!
//! AMF0 is the original Action Message Format used in Flash/RTMP.
//! Reference: AMF0 File Format Specification (amf0-file-format-specification.pdf)
//!
//! Type Markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x07 - Reference (16-bit index)
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! 0x0D - Unsupported
//! 0x0F - XML Document
//! 0x10 - Typed Object (class name + properties)
//! ```
//!
//! Any other marker (MovieClip, RecordSet, the AVM+ switch to AMF3) is a
//! decode error.
//!
//! Reference markers are resolved against a table of the complex values
//! (objects, arrays, typed objects) decoded so far in the same pass, in the
//! order they finished decoding. Resolution copies the referenced value, so
//! re-encoding a decoded value writes the copy out in full rather than a
//! reference marker. Values survive the round trip, sharing does not.

use bytes::{BufMut, Bytes, BytesMut};

use super::value::{AmfObject, AmfValue};
use crate::cursor::ByteReader;
use crate::error::AmfError;

// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    /// Completed complex values, addressable by reference markers
    references: Vec<AmfValue>,
    /// Accept an object that runs to the end of the buffer without its end
    /// marker (OBS does this in some metadata)
    lenient: bool,
    /// Current nesting depth
    depth: usize,
}

impl Amf0Decoder {
    /// Create a new decoder with default settings
    pub fn new() -> Self {
        Self::with_lenient(true)
    }

    /// Create decoder with explicit lenient mode setting
    pub fn with_lenient(lenient: bool) -> Self {
        Self {
            references: Vec::new(),
            lenient,
            depth: 0,
        }
    }

    /// Reset decoder state (call between messages)
    pub fn reset(&mut self) {
        self.references.clear();
        self.depth = 0;
    }

    /// Decode a single AMF0 value
    pub fn decode(&mut self, buf: &mut ByteReader<'_>) -> Result<AmfValue, AmfError> {
        let marker = buf.read_u8().ok_or(AmfError::UnexpectedEof)?;

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode all values until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut ByteReader<'_>) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while !buf.is_empty() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut ByteReader<'_>) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => Ok(AmfValue::Number(
                buf.read_f64().ok_or(AmfError::UnexpectedEof)?,
            )),
            MARKER_BOOLEAN => Ok(AmfValue::Boolean(
                buf.read_u8().ok_or(AmfError::UnexpectedEof)? != 0,
            )),
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => {
                let properties = self.decode_properties(buf)?;
                Ok(self.complete(AmfValue::Object(properties)))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            MARKER_REFERENCE => self.decode_reference(buf),
            MARKER_ECMA_ARRAY => {
                // Count hint, not always accurate
                let _count = buf.read_u32().ok_or(AmfError::UnexpectedEof)?;
                let properties = self.decode_properties(buf)?;
                Ok(self.complete(AmfValue::EcmaArray(properties)))
            }
            MARKER_STRICT_ARRAY => self.decode_strict_array(buf),
            MARKER_DATE => {
                let millis = buf.read_f64().ok_or(AmfError::UnexpectedEof)?;
                let timezone = buf.read_i16().ok_or(AmfError::UnexpectedEof)?;
                Ok(AmfValue::Date { millis, timezone })
            }
            MARKER_XML_DOCUMENT => Ok(AmfValue::Xml(read_utf8_long(buf)?)),
            MARKER_TYPED_OBJECT => {
                let class_name = read_utf8(buf)?;
                let properties = self.decode_properties(buf)?;
                Ok(self.complete(AmfValue::TypedObject {
                    class_name,
                    properties,
                }))
            }
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    /// Record a finished complex value in the reference table
    fn complete(&mut self, value: AmfValue) -> AmfValue {
        self.references.push(value.clone());
        value
    }

    /// Name/value pairs up to the empty-name + object-end terminator
    fn decode_properties(&mut self, buf: &mut ByteReader<'_>) -> Result<AmfObject, AmfError> {
        let mut properties = AmfObject::new();

        loop {
            if self.lenient && buf.is_empty() {
                break;
            }

            let key = read_utf8(buf)?;
            if key.is_empty() {
                match buf.read_u8() {
                    Some(MARKER_OBJECT_END) => break,
                    None if self.lenient => break,
                    None => return Err(AmfError::UnexpectedEof),
                    Some(_) => return Err(AmfError::InvalidObjectEnd),
                }
            }

            let value = self.decode(buf)?;
            properties.insert(key, value);
        }

        Ok(properties)
    }

    fn decode_strict_array(&mut self, buf: &mut ByteReader<'_>) -> Result<AmfValue, AmfError> {
        let count = buf.read_u32().ok_or(AmfError::UnexpectedEof)? as usize;

        let mut elements = Vec::with_capacity(count.min(1024)); // Cap initial allocation
        for _ in 0..count {
            elements.push(self.decode(buf)?);
        }

        Ok(self.complete(AmfValue::StrictArray(elements)))
    }

    fn decode_reference(&mut self, buf: &mut ByteReader<'_>) -> Result<AmfValue, AmfError> {
        let index = buf.read_u16().ok_or(AmfError::UnexpectedEof)?;
        self.references
            .get(index as usize)
            .cloned()
            .ok_or(AmfError::InvalidReference(index))
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut ByteReader<'_>) -> Result<String, AmfError> {
    let len = buf.read_u16().ok_or(AmfError::UnexpectedEof)? as usize;
    let bytes = buf.read_bytes(len).ok_or(AmfError::UnexpectedEof)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut ByteReader<'_>) -> Result<String, AmfError> {
    let len = buf.read_u32().ok_or(AmfError::UnexpectedEof)? as usize;
    let bytes = buf.read_bytes(len).ok_or(AmfError::UnexpectedEof)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Get current encoded length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if encoder is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    ///
    /// Object properties with an empty name cannot be represented (the empty
    /// name is the terminator) and are skipped.
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            AmfValue::Undefined => {
                self.buf.put_u8(MARKER_UNDEFINED);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
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
            AmfValue::StrictArray(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::Date { millis, timezone } => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(*timezone);
            }
            AmfValue::Xml(s) => {
                self.buf.put_u8(MARKER_XML_DOCUMENT);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::TypedObject {
                class_name,
                properties,
            } => {
                self.buf.put_u8(MARKER_TYPED_OBJECT);
                self.write_utf8(class_name);
                self.write_properties(properties);
            }
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &AmfObject) {
        for (key, val) in props.iter().filter(|(k, _)| !k.is_empty()) {
            self.write_utf8(key);
            self.encode(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let mut len = s.len().min(0xFFFF);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Convenience function to encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    Amf0Decoder::new().decode(&mut ByteReader::new(data))
}

/// Convenience function to decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    Amf0Decoder::new().decode_all(&mut ByteReader::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn finite_f64() -> impl Strategy<Value = f64> {
        any::<f64>().prop_filter("NaN never compares equal", |n| !n.is_nan())
    }

    fn arb_value() -> impl Strategy<Value = AmfValue> {
        let leaf = prop_oneof![
            finite_f64().prop_map(AmfValue::Number),
            any::<bool>().prop_map(AmfValue::Boolean),
            ".{0,24}".prop_map(AmfValue::String),
            Just(AmfValue::Null),
            Just(AmfValue::Undefined),
            (finite_f64(), any::<i16>())
                .prop_map(|(millis, timezone)| AmfValue::Date { millis, timezone }),
            ".{0,24}".prop_map(AmfValue::Xml),
        ];
        leaf.prop_recursive(3, 32, 5, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(AmfValue::StrictArray),
                prop::collection::vec(("[a-zA-Z]{1,8}", inner.clone()), 0..5)
                    .prop_map(|e| AmfValue::Object(e.into_iter().collect())),
                prop::collection::vec(("[a-zA-Z]{1,8}", inner.clone()), 0..5)
                    .prop_map(|e| AmfValue::EcmaArray(e.into_iter().collect())),
                ("[A-Z][a-z]{0,8}", prop::collection::vec(("[a-z]{1,6}", inner), 0..4)).prop_map(
                    |(class_name, e)| AmfValue::TypedObject {
                        class_name,
                        properties: e.into_iter().collect(),
                    }
                ),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(value in arb_value()) {
            let encoded = encode(&value);
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_object_roundtrip_preserves_order() {
        let value = AmfValue::Object(AmfObject::from([
            ("name", AmfValue::String("test".into())),
            ("value", AmfValue::Number(123.0)),
            ("flag", AmfValue::Boolean(false)),
        ]));

        let encoded = encode(&value);
        assert_eq!(encoded[0], MARKER_OBJECT);
        assert_eq!(&encoded[encoded.len() - 3..], &[0x00, 0x00, MARKER_OBJECT_END]);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_multiple_values() {
        let values = vec![
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Null,
        ];

        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_long_string() {
        let long_str = "x".repeat(70000);
        let encoded = encode(&AmfValue::String(long_str.clone()));
        assert_eq!(encoded[0], MARKER_LONG_STRING);
        assert_eq!(decode(&encoded).unwrap(), AmfValue::String(long_str));
    }

    #[test]
    fn test_exact_number_layout() {
        let encoded = encode(&AmfValue::Number(1.0));
        assert_eq!(&encoded[..], &[0x00, 0x3F, 0xF0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_marker_is_error() {
        assert!(matches!(decode(&[0x04]), Err(AmfError::UnknownMarker(0x04))));
        assert!(matches!(decode(&[0x11, 0x02]), Err(AmfError::UnknownMarker(0x11))));
    }

    #[test]
    fn test_reference_resolves_completed_object() {
        // [ {a: 1}, ref(0) ]
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_STRICT_ARRAY);
        buf.put_u32(2);
        buf.put_u8(MARKER_OBJECT);
        buf.put_u16(1);
        buf.put_slice(b"a");
        buf.put_u8(MARKER_NUMBER);
        buf.put_f64(1.0);
        buf.put_u16(0);
        buf.put_u8(MARKER_OBJECT_END);
        buf.put_u8(MARKER_REFERENCE);
        buf.put_u16(0);

        let decoded = decode(&buf).unwrap();
        let inner = AmfValue::Object(AmfObject::from([("a", 1.0)]));
        assert_eq!(decoded, AmfValue::StrictArray(vec![inner.clone(), inner]));

        // Sharing is not reconstructed: the copy is written out in full
        let reencoded = encode(&decoded);
        assert!(reencoded.len() > buf.len());
        assert_eq!(decode(&reencoded).unwrap(), decoded);
    }

    #[test]
    fn test_reference_to_unfinished_object_fails() {
        // {self: ref(0)} - the object is not complete when the reference is read
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_OBJECT);
        buf.put_u16(4);
        buf.put_slice(b"self");
        buf.put_u8(MARKER_REFERENCE);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u8(MARKER_OBJECT_END);

        assert!(matches!(decode(&buf), Err(AmfError::InvalidReference(0))));
    }

    #[test]
    fn test_missing_object_end() {
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_OBJECT);
        buf.put_u16(1);
        buf.put_slice(b"k");
        buf.put_u8(MARKER_NULL);

        let lenient = decode(&buf).unwrap();
        assert_eq!(lenient.get("k"), Some(&AmfValue::Null));

        let strict = Amf0Decoder::with_lenient(false).decode(&mut ByteReader::new(&buf));
        assert!(matches!(strict, Err(AmfError::UnexpectedEof)));
    }

    #[test]
    fn test_truncated_input() {
        assert!(matches!(decode(&[]), Err(AmfError::UnexpectedEof)));
        assert!(matches!(decode(&[0x00, 0x01]), Err(AmfError::UnexpectedEof)));
        assert!(matches!(decode(&[0x02, 0x00, 0x05, b'a']), Err(AmfError::UnexpectedEof)));
    }
}
