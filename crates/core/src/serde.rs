//! De-/serialization helpers shared by the wire types.

/// Check whether a value is equal to its default, for use with
/// `skip_serializing_if`.
pub fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

pub mod duration {
    //! De-/serialization for `std::time::Duration` represented as integers.

    pub mod opt_ms {
        //! De-/serialization for `Option<Duration>` represented as milliseconds.

        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, ser::Error};

        pub fn serialize<S>(opt_duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match opt_duration {
                Some(duration) => match u64::try_from(duration.as_millis()) {
                    Ok(ms) => serializer.serialize_u64(ms),
                    Err(err) => Err(S::Error::custom(err)),
                },
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct DurationTest {
        #[serde(
            with = "super::duration::opt_ms",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        timeout: Option<Duration>,
    }

    #[test]
    fn duration_opt_ms_round_trip() {
        let value = DurationTest {
            timeout: Some(Duration::from_secs(30)),
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({ "timeout": 30_000 }));
        assert_eq!(serde_json::from_value::<DurationTest>(json).unwrap(), value);
    }

    #[test]
    fn duration_opt_ms_absent() {
        let value: DurationTest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(value, DurationTest { timeout: None });
        assert_eq!(serde_json::to_value(&value).unwrap(), json!({}));
    }
}
