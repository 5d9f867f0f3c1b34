//! Serde integration support.

use std::fmt;

use serde::de::{Error, Unexpected, Visitor};
use serde::*;

/// Ignore deserialization errors and revert to default.
pub fn ignore_errors<'d, T: Deserialize<'d> + Default, D: Deserializer<'d>>(
    d: D,
) -> Result<T, D::Error> {
    use serde_json::Value;

    let v = Value::deserialize(d)?;
    Ok(T::deserialize(v).ok().unwrap_or_default())
}

/// Deserialize a maybe-string ID into a u64.
pub fn deserialize_id<'d, D: Deserializer<'d>>(d: D) -> Result<u64, D::Error> {
    struct IdVisitor;
    impl<'d> Visitor<'d> for IdVisitor {
        type Value = u64;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            write!(fmt, "a u64 or parseable string")
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<u64, E> {
            if v >= 0 {
                Ok(v as u64)
            } else {
                Err(E::invalid_value(Unexpected::Signed(v), &self))
            }
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<u64, E> {
            v.parse::<u64>()
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_any(IdVisitor)
}

/// Deserialize a maybe-string discriminator into a u16.
/// Also enforces 0 <= N <= 9999.
pub fn deserialize_discrim_opt<'d, D: Deserializer<'d>>(d: D) -> Result<Option<u16>, D::Error> {
    struct DiscrimVisitor;
    impl<'d> Visitor<'d> for DiscrimVisitor {
        type Value = Option<u16>;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            write!(fmt, "a u16 in [0, 9999] or parseable string")
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            if (0..=9999).contains(&v) {
                Ok(Some(v as u16))
            } else {
                Err(E::invalid_value(Unexpected::Signed(v), &self))
            }
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            if v <= 9999 {
                Ok(Some(v as u16))
            } else {
                Err(E::invalid_value(Unexpected::Unsigned(v), &self))
            }
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            v.parse::<i64>()
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
                .and_then(|v| self.visit_i64(v))
        }
    }

    d.deserialize_any(DiscrimVisitor)
}

pub fn deserialize_discrim<'d, D: Deserializer<'d>>(d: D) -> Result<u16, D::Error> {
    match deserialize_discrim_opt(d) {
        Ok(Some(result)) => Ok(result),
        Err(e) => Err(e),
        Ok(None) => Err(D::Error::missing_field("discriminator")),
    }
}

/// Deserialize a partial user object, of which only the `id` field is
/// guaranteed to be present, into a bare user ID.
pub fn deserialize_user_id<'d, D: Deserializer<'d>>(
    d: D,
) -> Result<crate::model::UserId, D::Error> {
    #[derive(Deserialize)]
    struct PartialUser {
        id: crate::model::UserId,
    }

    PartialUser::deserialize(d).map(|user| user.id)
}

/// Make sure a field holds a certain numeric value, or fail otherwise.
#[derive(Debug, Clone, Default)]
pub struct Eq<const N: u64>;

impl<'de, const N: u64> Deserialize<'de> for Eq<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NumberVisitor<const N: u64>;

        impl<'d, const N: u64> Visitor<'d> for NumberVisitor<N> {
            type Value = u64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "the number {}", N)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: Error,
            {
                if v == N {
                    Ok(v)
                } else {
                    Err(E::invalid_value(Unexpected::Unsigned(v), &self))
                }
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: Error,
            {
                if v >= 0 && v as u64 == N {
                    Ok(v as u64)
                } else {
                    Err(E::invalid_value(Unexpected::Signed(v), &self))
                }
            }
        }

        deserializer.deserialize_any(NumberVisitor::<N>)?;
        Ok(Self)
    }
}

impl<const N: u64> Serialize for Eq<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Tagged {
        #[allow(dead_code)]
        op: Eq<10>,
    }

    #[test]
    fn const_eq_accepts_matching_opcode() {
        assert!(serde_json::from_value::<Tagged>(json!({ "op": 10 })).is_ok());
    }

    #[test]
    fn const_eq_rejects_other_opcodes() {
        assert!(serde_json::from_value::<Tagged>(json!({ "op": 11 })).is_err());
        assert!(serde_json::from_value::<Tagged>(json!({ "op": -1 })).is_err());
    }

    #[test]
    fn ids_parse_from_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Id(#[serde(deserialize_with = "deserialize_id")] u64);

        let Id(a) = serde_json::from_value(json!("131994742625534720")).unwrap();
        let Id(b) = serde_json::from_value(json!(131994742625534720u64)).unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_value::<Id>(json!("not a number")).is_err());
    }

    #[test]
    fn discriminators_are_bounded() {
        #[derive(Deserialize)]
        struct D(#[serde(deserialize_with = "deserialize_discrim")] u16);

        let D(d) = serde_json::from_value(json!("0042")).unwrap();
        assert_eq!(d, 42);
        assert!(serde_json::from_value::<D>(json!(10000)).is_err());
    }
}
