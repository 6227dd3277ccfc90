use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{self, Deserialize, Deserializer, Serializer};

pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(timestamp))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse(&s).map_err(serde::de::Error::custom)
}

/// RFC 3339 with exactly six fractional digits and a `Z` suffix.
pub fn format(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(6))
        .map_err(|e| format!("invalid timestamp {s:?}: {e}"))
}

/// Current time at the precision the ledger stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
