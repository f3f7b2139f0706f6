use serde::de::{self, Deserializer, Visitor};
use serde_json::Value;
use std::fmt;

struct F64OptVisitor {
    strict: bool,
}

impl F64OptVisitor {
    fn parse<E: de::Error>(&self, value: &str) -> Result<Option<f64>, E> {
        match value.trim().parse::<f64>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) if self.strict => Err(E::invalid_value(de::Unexpected::Str(value), self)),
            Err(_) => Ok(None),
        }
    }
}

impl<'de> Visitor<'de> for F64OptVisitor {
    type Value = Option<f64>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a number or numeric string")
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(None)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(None)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Some(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Some(value as f64))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Some(value as f64))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.parse(value)
    }
}

/// Accepts numbers, numeric strings, or null. Unparseable strings become `None`.
pub fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(F64OptVisitor { strict: false })
}

/// Like [`deserialize_f64_opt`], but a string that is not a number is an error.
pub fn deserialize_f64_strict_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(F64OptVisitor { strict: true })
}

/// Reads a JSON value as a finite number, allowing numeric strings.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Reads a JSON value as epoch milliseconds.
pub fn value_as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|v| v as i64)),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}
