//! Token amounts in base units travel as integer strings.

use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s
            .trim()
            .parse::<u128>()
            .map_err(|_| de::Error::custom(format!("invalid raw amount: {}", s))),
        Raw::Number(n) => Ok(u128::from(n)),
    }
}

/// Same as the parent module for `Option<u128>`
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u128>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] u128);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(v)| v))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Holder {
        #[serde(with = "super")]
        amount: u128,
        #[serde(with = "super::option", default)]
        min_out: Option<u128>,
    }

    #[test]
    fn test_accepts_string_and_number() {
        let a: Holder = serde_json::from_str(r#"{"amount":"1000000"}"#).unwrap();
        let b: Holder = serde_json::from_str(r#"{"amount":1000000,"min_out":"5"}"#).unwrap();
        assert_eq!(a.amount, 1_000_000);
        assert_eq!(a.min_out, None);
        assert_eq!(b.min_out, Some(5));
    }

    #[test]
    fn test_serializes_as_string() {
        let h = Holder {
            amount: 340_282_366_920_938_463_463_374_607_431_768_211_455,
            min_out: None,
        };
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(
            json["amount"],
            "340282366920938463463374607431768211455"
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"amount":"12abc"}"#).is_err());
    }
}
