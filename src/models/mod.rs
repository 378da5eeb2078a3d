pub mod message;
pub mod notification;
pub mod project;
pub mod task;
pub mod user;

use chrono::Utc;
use mongodb::bson::Bson;

/// Current time encoded the same way the models store `DateTime<Utc>`.
pub fn now_bson() -> Bson {
    timestamp::bson(&Utc::now())
}

/// Timestamps are stored as RFC 3339 UTC strings with a fixed nine-digit
/// fraction, so lexical order in the database equals chronological order.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use mongodb::bson::Bson;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn bson(dt: &DateTime<Utc>) -> Bson {
        Bson::String(format(dt))
    }

    pub fn bson_opt(dt: Option<&DateTime<Utc>>) -> Bson {
        dt.map_or(Bson::Null, bson)
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        DateTime::<Utc>::deserialize(d)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_some(&format(dt)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<DateTime<Utc>>::deserialize(d)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "timestamp")]
        at: DateTime<Utc>,
        #[serde(default, with = "timestamp::option")]
        maybe: Option<DateTime<Utc>>,
    }

    #[test]
    fn stored_timestamps_sort_chronologically() {
        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = whole + Duration::milliseconds(500);
        // Default chrono output would give "12:00:00Z" and "12:00:00.500Z",
        // which compare the wrong way round as strings.
        assert!(timestamp::format(&whole) < timestamp::format(&later));
        assert_eq!(timestamp::format(&whole), "2024-05-01T12:00:00.000000000Z");
        assert_eq!(timestamp::bson(&later), Bson::String("2024-05-01T12:00:00.500000000Z".into()));
        assert_eq!(timestamp::bson_opt(None), Bson::Null);
    }

    #[test]
    fn stamped_fields_round_trip_and_accept_legacy_values() {
        let at = Utc::now();
        let json = serde_json::to_value(Stamped { at, maybe: None }).unwrap();
        assert_eq!(json["at"], timestamp::format(&at));
        let back: Stamped = serde_json::from_value(json).unwrap();
        assert_eq!(back.at, at);
        assert!(back.maybe.is_none());

        let legacy: Stamped =
            serde_json::from_str(r#"{"at":"2024-05-01T12:00:00Z","maybe":"2024-05-02T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(legacy.at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        assert!(legacy.maybe.is_some());
    }
}
