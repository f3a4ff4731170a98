//! Metadata helpers
//!
//! `k8s-openapi` timestamp wrappers serialize as RFC 3339 strings; going
//! through that representation keeps these helpers independent of the
//! date/time backend the wrappers use internally.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Converts a Kubernetes `Time`/`MicroTime` into a chrono timestamp.
pub fn to_utc<T: Serialize>(time: &T) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Converts a chrono timestamp into a Kubernetes `Time`/`MicroTime`.
pub fn from_utc<T: DeserializeOwned>(time: DateTime<Utc>) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::String(
        time.to_rfc3339_opts(SecondsFormat::Micros, true),
    ))
}

/// `metadata.creationTimestamp` as chrono.
pub fn creation_time(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.creation_timestamp.as_ref().and_then(to_utc)
}
