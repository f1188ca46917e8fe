use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use crate::cbor::Error;
use crate::cbor;

/// Opaque interpreter value in its wire form: CBOR bytes.
///
/// How interpreter-native values map to and from this shape is up to the
/// [`Interpreter`](crate::sandbox::Interpreter) implementation; the bridge
/// only copies the bytes across.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(Bytes);

impl Value {
    #[must_use]
    pub fn from_cbor(value: impl Into<Bytes>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_cbor(&self) -> &[u8] {
        self.0.as_ref()
    }

    #[must_use]
    pub fn into_cbor(self) -> Bytes {
        self.0
    }

    /// Convert a JSON value into a wire `Value`.
    ///
    /// # Errors
    /// Returns an error if CBOR serialization fails.
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self, Error> {
        Self::from_serde(value)
    }

    /// Convert a wire `Value` into a JSON value.
    ///
    /// # Errors
    /// Returns an error if CBOR parsing or JSON parsing fails.
    pub fn to_json_value(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::from_str(&self.to_json()?)?)
    }

    /// Convert a JSON string into a wire `Value`.
    ///
    /// # Errors
    /// Returns an error if JSON parsing or CBOR serialization fails.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        cbor::json_to_cbor(json).map(Self)
    }

    /// Convert a wire `Value` into a JSON string.
    ///
    /// # Errors
    /// Returns an error if CBOR parsing or JSON serialization fails.
    pub fn to_json(&self) -> Result<String, Error> {
        cbor::cbor_to_json(self.as_cbor())
    }

    /// Serialize a serde value into a wire `Value`.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn from_serde<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        cbor::to_cbor(value).map(Self)
    }

    /// Deserialize a wire `Value` into a serde value.
    ///
    /// # Errors
    /// Returns an error if deserialization fails.
    pub fn to_serde<T: DeserializeOwned>(&self) -> Result<T, Error> {
        cbor::from_cbor(self.as_cbor())
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<Value> for Bytes {
    fn from(value: Value) -> Self {
        value.0
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        self.as_cbor()
    }
}

#[cfg(test)]
mod tests {
    use super::Value;

    #[test]
    fn json_object_keeps_shape() {
        let value = Value::from_json(r#"{"x":[1.5,2.5],"label":"calc"}"#).unwrap();
        assert_eq!(
            value.to_json_value().unwrap(),
            serde_json::json!({"x": [1.5, 2.5], "label": "calc"})
        );
    }

    #[test]
    fn null_survives_cbor_bytes() {
        let value = Value::from_json_value(&serde_json::Value::Null).unwrap();
        let again = Value::from_cbor(value.clone().into_cbor());
        assert_eq!(again, value);
        assert_eq!(again.to_json().unwrap(), "null");
    }

    #[test]
    fn serde_types_convert() {
        let input = (vec![1.0_f64, 2.0], Some("a".to_string()));
        let value = Value::from_serde(&input).unwrap();
        let output: (Vec<f64>, Option<String>) = value.to_serde().unwrap();
        assert_eq!(output, input);
        assert!(value.to_serde::<String>().is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Value::from_cbor(vec![0xff, 0x00]).to_json_value().is_err());
        assert!(Value::from_json("[1,").is_err());
    }

    #[test]
    fn value_nested_in_frame_keeps_bytes() {
        let inner = Value::from_serde(&[1.5_f64, 2.5]).unwrap();
        let outer = crate::cbor::to_cbor(&inner).unwrap();
        let back: Value = crate::cbor::from_cbor(&outer).unwrap();
        assert_eq!(back, inner);
        let numbers: Vec<f64> = back.to_serde().unwrap();
        assert_eq!(numbers, vec![1.5, 2.5]);
    }
}
