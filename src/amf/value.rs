//! AMF value types
//!
//! The typed value model carried by command and data messages. Objects keep
//! their properties in insertion order with unique keys, since servers (and
//! the FLV `onMetaData` convention) care about property order.
//!
//! AMF0 reference markers are a decode-time concept: the decoder resolves them
//! to a copy of the referenced value, so there is no reference variant here.

/// Ordered string-keyed property list with unique keys
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AmfObject {
    entries: Vec<(String, AmfValue)>,
}

impl AmfObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing (in place) any existing value for `key`
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AmfValue>) -> Option<AmfValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<AmfValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AmfValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<AmfValue>> FromIterator<(K, V)> for AmfObject {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut obj = AmfObject::new();
        for (k, v) in iter {
            obj.insert(k, v);
        }
        obj
    }
}

impl<K: Into<String>, V: Into<AmfValue>, const N: usize> From<[(K, V); N]> for AmfObject {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

/// AMF0 value representation
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// IEEE 754 double (0x00)
    Number(f64),

    /// Boolean (0x01)
    Boolean(bool),

    /// UTF-8 string (0x02, or 0x0C when longer than 65535 bytes)
    String(String),

    /// Anonymous object (0x03)
    Object(AmfObject),

    /// Null (0x05)
    #[default]
    Null,

    /// Undefined (0x06)
    Undefined,

    /// Associative array (0x08)
    EcmaArray(AmfObject),

    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),

    /// Date (0x0B): milliseconds since the Unix epoch plus a timezone offset
    /// in minutes, which the format deprecates but still transmits
    Date { millis: f64, timezone: i16 },

    /// XML document (0x0F)
    Xml(String),

    /// Object with a registered class name (0x10)
    TypedObject {
        class_name: String,
        properties: AmfObject,
    },
}

impl AmfValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Properties of an object, ECMA array or typed object
    pub fn as_object(&self) -> Option<&AmfObject> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            AmfValue::TypedObject { properties, .. } => Some(properties),
            _ => None,
        }
    }

    /// Try to get this value as an array reference
    pub fn as_array(&self) -> Option<&[AmfValue]> {
        match self {
            AmfValue::StrictArray(a) => Some(a),
            _ => None,
        }
    }

    /// Get a property from an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<i32> for AmfValue {
    fn from(v: i32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<AmfObject> for AmfValue {
    fn from(v: AmfObject) -> Self {
        AmfValue::Object(v)
    }
}

impl<V: Into<AmfValue>> From<Vec<V>> for AmfValue {
    fn from(v: Vec<V>) -> Self {
        AmfValue::StrictArray(v.into_iter().map(|x| x.into()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let s = AmfValue::String("test".into());
        assert_eq!(s.as_str(), Some("test"));
        assert_eq!(s.as_number(), None);

        let n = AmfValue::Number(42.0);
        assert_eq!(n.as_number(), Some(42.0));
        assert_eq!(n.as_str(), None);

        let o = AmfValue::Object(AmfObject::from([("key", "value")]));
        assert_eq!(o.get_string("key"), Some("value"));
        assert_eq!(o.get("missing"), None);
    }

    #[test]
    fn test_object_keeps_order_and_unique_keys() {
        let mut obj = AmfObject::new();
        obj.insert("b", 1.0);
        obj.insert("a", 2.0);
        assert_eq!(obj.insert("b", 3.0), Some(AmfValue::Number(1.0)));

        let keys: Vec<&str> = obj.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(obj.get("b"), Some(&AmfValue::Number(3.0)));
        assert_eq!(obj.len(), 2);

        assert_eq!(obj.remove("b"), Some(AmfValue::Number(3.0)));
        assert_eq!(obj.len(), 1);
    }

    #[test]
    fn test_from_conversions() {
        let v: AmfValue = "test".into();
        assert!(matches!(v, AmfValue::String(_)));

        let v: AmfValue = 42.0.into();
        assert!(matches!(v, AmfValue::Number(_)));

        let v: AmfValue = true.into();
        assert!(matches!(v, AmfValue::Boolean(true)));

        let v: AmfValue = vec![1.0, 2.0].into();
        assert_eq!(v.as_array().map(|a| a.len()), Some(2));
    }
}
