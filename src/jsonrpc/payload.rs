//! Type-erased message payloads.
//!
//! The codec resolves `params`/`result`/`body` fields into concrete Rust types
//! through the method registry. Since the message model itself is not generic,
//! resolved values are carried behind [`AnyPayload`] and recovered by the
//! receiving side with [`Payload::downcast_ref`] or [`Payload::decode`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A resolved payload value of some concrete type.
pub trait AnyPayload: Any + Debug + Send + Sync {
    /// Serialize the value to its natural JSON shape.
    fn to_json(&self) -> serde_json::Result<Value>;

    fn as_any(&self) -> &dyn Any;

    /// Equality against another erased payload of the same concrete type.
    fn payload_eq(&self, other: &dyn AnyPayload) -> bool;

    fn type_name(&self) -> &'static str;
}

impl<T> AnyPayload for T
where
    T: Serialize + Debug + PartialEq + Send + Sync + 'static,
{
    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payload_eq(&self, other: &dyn AnyPayload) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// `params`, `result` or `body` of a message
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// The field is absent on the wire
    #[default]
    None,
    /// An unresolved JSON tree
    Json(Value),
    /// A value resolved to the type registered for the method
    Typed(Arc<dyn AnyPayload>),
}

impl Payload {
    pub fn typed<T: AnyPayload>(value: T) -> Self {
        Payload::Typed(Arc::new(value))
    }

    pub fn json(value: Value) -> Self {
        Payload::Json(value)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    pub fn is_typed(&self) -> bool {
        matches!(self, Payload::Typed(_))
    }

    /// JSON form of the payload, `None` when the field is absent.
    pub fn to_json(&self) -> serde_json::Result<Option<Value>> {
        match self {
            Payload::None => Ok(None),
            Payload::Json(value) => Ok(Some(value.clone())),
            Payload::Typed(value) => value.to_json().map(Some),
        }
    }

    /// Borrow the resolved value if it has type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Payload::Typed(value) => value.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Obtain the payload as `T`.
    ///
    /// Resolved values of type `T` are cloned; anything else goes through its
    /// JSON form, so untyped payloads are decoded on demand. An absent payload
    /// decodes from `null`.
    pub fn decode<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned + Clone + 'static,
    {
        if let Some(value) = self.downcast_ref::<T>() {
            return Ok(value.clone());
        }
        match self {
            Payload::None => serde_json::from_value(Value::Null),
            Payload::Json(value) => T::deserialize(value),
            Payload::Typed(value) => serde_json::from_value(value.to_json()?),
        }
    }

    /// Name of the concrete type held, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::None => "none",
            Payload::Json(_) => "json",
            Payload::Typed(value) => value.type_name(),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::None, Payload::None) => true,
            (Payload::Json(a), Payload::Json(b)) => a == b,
            (Payload::Typed(a), Payload::Typed(b)) => a.payload_eq(b.as_ref()),
            // 値が null になるペイロードはワイヤ上で欠落と区別できない
            (Payload::None, other) | (other, Payload::None) => matches!(other.to_json(), Ok(Some(Value::Null))),
            (a, b) => match (a.to_json(), b.to_json()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_typed_payload_downcast() {
        let payload = Payload::typed(Point { x: 1, y: 2 });
        assert!(payload.is_typed());
        assert_eq!(payload.downcast_ref::<Point>(), Some(&Point { x: 1, y: 2 }));
        assert!(payload.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_decode_from_json_tree() {
        let payload = Payload::json(json!({"x": 3, "y": 4}));
        let point: Point = payload.decode().unwrap();
        assert_eq!(point, Point { x: 3, y: 4 });
    }

    #[test]
    fn test_decode_absent_payload_as_unit() {
        let payload = Payload::None;
        payload.decode::<()>().unwrap();
        assert_eq!(payload.decode::<Option<Point>>().unwrap(), None);
        assert!(payload.decode::<Point>().is_err());
    }

    #[test]
    fn test_payload_equality() {
        let typed = Payload::typed(Point { x: 1, y: 2 });
        assert_eq!(typed, Payload::typed(Point { x: 1, y: 2 }));
        assert_ne!(typed, Payload::typed(Point { x: 2, y: 2 }));
        // mixed representations compare through JSON
        assert_eq!(typed, Payload::json(json!({"x": 1, "y": 2})));
        assert_ne!(typed, Payload::None);
    }

    #[test]
    fn test_null_payloads_equal_absent() {
        assert_eq!(Payload::typed(()), Payload::None);
        assert_eq!(Payload::None, Payload::json(Value::Null));
        assert_ne!(Payload::None, Payload::typed(0));
    }

    #[test]
    fn test_to_json() {
        assert_eq!(Payload::None.to_json().unwrap(), None);
        assert_eq!(
            Payload::typed(Point { x: 0, y: 1 }).to_json().unwrap(),
            Some(json!({"x": 0, "y": 1}))
        );
    }
}
