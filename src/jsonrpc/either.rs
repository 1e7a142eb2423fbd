//! Untagged unions used by protocol payload shapes.
//!
//! Neither type writes a discriminator. Encoding emits the populated
//! alternative's natural JSON; decoding tries the alternatives in declaration
//! order and keeps the first one that fits, so ambiguous input always resolves
//! to the earliest compatible alternative.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Raised when a JSON value fits none of the alternatives
#[derive(Debug, thiserror::Error)]
#[error("value matches none of the alternatives ({alternatives}): {reasons}")]
pub struct EitherError {
    alternatives: String,
    reasons: String,
}

impl EitherError {
    fn new(attempts: &[(&'static str, serde_json::Error)]) -> Self {
        let alternatives = attempts
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" | ");
        let reasons = attempts
            .iter()
            .map(|(name, e)| format!("{}: {}", name, e))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            alternatives,
            reasons,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

impl<L, R> Either<L, R> {
    pub fn is_left(&self) -> bool {
        matches!(self, Either::Left(_))
    }

    pub fn is_right(&self) -> bool {
        matches!(self, Either::Right(_))
    }

    pub fn left(&self) -> Option<&L> {
        match self {
            Either::Left(l) => Some(l),
            Either::Right(_) => None,
        }
    }

    pub fn right(&self) -> Option<&R> {
        match self {
            Either::Left(_) => None,
            Either::Right(r) => Some(r),
        }
    }

    pub fn map<T>(self, left: impl FnOnce(L) -> T, right: impl FnOnce(R) -> T) -> T {
        match self {
            Either::Left(l) => left(l),
            Either::Right(r) => right(r),
        }
    }
}

impl<L, R> Either<L, R>
where
    L: DeserializeOwned,
    R: DeserializeOwned,
{
    /// Resolve a JSON value against `L`, then `R`.
    pub fn from_json(value: Value) -> Result<Self, EitherError> {
        let left_err = match L::deserialize(&value) {
            Ok(l) => return Ok(Either::Left(l)),
            Err(e) => e,
        };
        match R::deserialize(value) {
            Ok(r) => Ok(Either::Right(r)),
            Err(right_err) => Err(EitherError::new(&[
                (std::any::type_name::<L>(), left_err),
                (std::any::type_name::<R>(), right_err),
            ])),
        }
    }
}

impl<L: Serialize, R: Serialize> Serialize for Either<L, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Either::Left(l) => l.serialize(serializer),
            Either::Right(r) => r.serialize(serializer),
        }
    }
}

impl<'de, L, R> Deserialize<'de> for Either<L, R>
where
    L: DeserializeOwned,
    R: DeserializeOwned,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Either::from_json(value).map_err(D::Error::custom)
    }
}

/// Three-way untagged union
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Either3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

impl<A, B, C> Either3<A, B, C> {
    pub fn first(&self) -> Option<&A> {
        match self {
            Either3::First(a) => Some(a),
            _ => None,
        }
    }

    pub fn second(&self) -> Option<&B> {
        match self {
            Either3::Second(b) => Some(b),
            _ => None,
        }
    }

    pub fn third(&self) -> Option<&C> {
        match self {
            Either3::Third(c) => Some(c),
            _ => None,
        }
    }
}

impl<A, B, C> Either3<A, B, C>
where
    A: DeserializeOwned,
    B: DeserializeOwned,
    C: DeserializeOwned,
{
    pub fn from_json(value: Value) -> Result<Self, EitherError> {
        let first_err = match A::deserialize(&value) {
            Ok(a) => return Ok(Either3::First(a)),
            Err(e) => e,
        };
        let second_err = match B::deserialize(&value) {
            Ok(b) => return Ok(Either3::Second(b)),
            Err(e) => e,
        };
        match C::deserialize(value) {
            Ok(c) => Ok(Either3::Third(c)),
            Err(third_err) => Err(EitherError::new(&[
                (std::any::type_name::<A>(), first_err),
                (std::any::type_name::<B>(), second_err),
                (std::any::type_name::<C>(), third_err),
            ])),
        }
    }
}

impl<A: Serialize, B: Serialize, C: Serialize> Serialize for Either3<A, B, C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Either3::First(a) => a.serialize(serializer),
            Either3::Second(b) => b.serialize(serializer),
            Either3::Third(c) => c.serialize(serializer),
        }
    }
}

impl<'de, A, B, C> Deserialize<'de> for Either3<A, B, C>
where
    A: DeserializeOwned,
    B: DeserializeOwned,
    C: DeserializeOwned,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Either3::from_json(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MarkupContent {
        kind: String,
        value: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Location {
        uri: String,
        line: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hover {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        contents: Option<Either<String, MarkupContent>>,
    }

    #[test]
    fn test_serializes_without_tag() {
        let value: Either<String, MarkupContent> = Either::Left("plain".to_string());
        assert_eq!(serde_json::to_value(&value).unwrap(), json!("plain"));

        let value: Either<String, MarkupContent> = Either::Right(MarkupContent {
            kind: "markdown".to_string(),
            value: "# x".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"kind": "markdown", "value": "# x"})
        );
    }

    #[test]
    fn test_decodes_by_json_kind() {
        let left: Either<String, MarkupContent> = serde_json::from_value(json!("plain")).unwrap();
        assert_eq!(left, Either::Left("plain".to_string()));

        let right: Either<String, MarkupContent> =
            serde_json::from_value(json!({"kind": "markdown", "value": "v"})).unwrap();
        assert!(right.is_right());
        assert_eq!(right.right().unwrap().kind, "markdown");
    }

    #[test]
    fn test_first_compatible_alternative_wins() {
        // both alternatives accept any object; the left one is chosen
        let value: Either<Value, MarkupContent> =
            serde_json::from_value(json!({"kind": "a", "value": "b"})).unwrap();
        assert!(value.is_left());
    }

    #[test]
    fn test_missing_required_field_falls_through() {
        let value: Either<MarkupContent, Location> =
            serde_json::from_value(json!({"uri": "file:///a", "line": 3})).unwrap();
        assert_eq!(
            value,
            Either::Right(Location {
                uri: "file:///a".to_string(),
                line: 3
            })
        );
    }

    #[test]
    fn test_no_alternative_matches() {
        let result: Result<Either<String, MarkupContent>, _> = serde_json::from_value(json!(42));
        let error = result.unwrap_err().to_string();
        assert!(error.contains("none of the alternatives"), "{}", error);
    }

    #[test]
    fn test_list_elements_resolve_independently() {
        let list: Vec<Either<String, Location>> = serde_json::from_value(json!([
            "a",
            {"uri": "file:///b", "line": 1},
            "c"
        ]))
        .unwrap();
        assert!(list[0].is_left());
        assert!(list[1].is_right());
        assert!(list[2].is_left());
    }

    #[test]
    fn test_optional_either_is_omitted() {
        let hover = Hover { contents: None };
        assert_eq!(serde_json::to_value(&hover).unwrap(), json!({}));

        let hover: Hover = serde_json::from_value(json!({"contents": null})).unwrap();
        assert_eq!(hover.contents, None);
    }

    #[test]
    fn test_either3_order() {
        let value: Either3<bool, i64, String> = serde_json::from_value(json!(5)).unwrap();
        assert_eq!(value, Either3::Second(5));
        let value: Either3<bool, i64, String> = serde_json::from_value(json!("s")).unwrap();
        assert_eq!(value.third(), Some(&"s".to_string()));
        let value: Either3<bool, i64, String> = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(value.first(), Some(&true));
        assert_eq!(serde_json::to_value(&value).unwrap(), json!(true));

        let result: Result<Either3<bool, i64, String>, _> = serde_json::from_value(json!([]));
        assert!(result.is_err());
    }

    #[test]
    fn test_nested_either() {
        type Nested = Either<i64, Either<String, Vec<Location>>>;
        let value: Nested = serde_json::from_value(json!([{"uri": "u", "line": 0}])).unwrap();
        match value {
            Either::Right(Either::Right(locations)) => assert_eq!(locations.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
