use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock instant used for every persisted cursor.
pub type Timestamp = DateTime<Utc>;

/// Text layout of timestamps inside coordination records and upstream payloads.
pub const DATETIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Formats a timestamp in the persisted record layout.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

/// Parses a timestamp written in the persisted record layout.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    NaiveDateTime::parse_from_str(raw.trim(), DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter for `Option<Timestamp>` fields.
///
/// Null, missing and empty strings all read back as `None`.
pub mod optional_timestamp {
    use super::{Timestamp, format_timestamp, parse_timestamp};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &Option<Timestamp>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(text) if text.trim().is_empty() => Ok(None),
            Some(text) => parse_timestamp(&text)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", text))),
        }
    }
}

/// Persisted progress of one periodic trigger or one account.
///
/// `next_start_time == None` means the cycle has never completed and should
/// run immediately. `updated_by` only ever feeds diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default, with = "optional_timestamp")]
    pub next_start_time: Option<Timestamp>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl ProgressRecord {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(next_start_time: Timestamp, updated_by: impl Into<String>) -> Self {
        Self {
            next_start_time: Some(next_start_time),
            updated_by: Some(updated_by.into()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.next_start_time.is_some()
    }

    /// Encodes the record as the flat JSON object stored in the coordination service.
    pub fn to_bytes(&self) -> crate::core::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::core::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An account with flow-log collection enabled, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDescriptor {
    #[serde(rename = "projectId", alias = "account_id")]
    pub account_id: String,
    #[serde(rename = "bucketName", alias = "bucket_name")]
    pub bucket_name: String,
    /// Most recent (re)enable instant of collection for this account.
    #[serde(
        rename = "enabledAt",
        alias = "enabled_at",
        default,
        with = "optional_timestamp"
    )]
    pub enabled_at: Option<Timestamp>,
}

impl AccountDescriptor {
    pub fn new(account_id: impl Into<String>, bucket_name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            bucket_name: bucket_name.into(),
            enabled_at: None,
        }
    }

    pub fn enabled_at(mut self, enabled_at: Timestamp) -> Self {
        self.enabled_at = Some(enabled_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn progress_record_uses_flat_two_field_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        let record = ProgressRecord::new(ts, "node-a");
        let json: serde_json::Value = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"next_start_time": "09-03-2024 14:05:00", "updated_by": "node-a"})
        );
    }

    #[test]
    fn empty_record_reads_back_uninitialized() {
        let record = ProgressRecord::from_bytes(br#"{"next_start_time": null, "updated_by": null}"#)
            .unwrap();
        assert!(!record.is_initialized());

        let blank = ProgressRecord::from_bytes(br#"{"next_start_time": ""}"#).unwrap();
        assert_eq!(blank, ProgressRecord::empty());
    }

    #[test]
    fn account_descriptor_accepts_upstream_field_names() {
        let account: AccountDescriptor = serde_json::from_str(
            r#"{"projectId": "acc-1", "bucketName": "flowlogs-acc-1", "enabledAt": "01-02-2024 00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(account.account_id, "acc-1");
        assert_eq!(account.bucket_name, "flowlogs-acc-1");
        assert_eq!(
            account.enabled_at,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );

        let never_toggled: AccountDescriptor =
            serde_json::from_str(r#"{"projectId": "acc-2", "bucketName": "b", "enabledAt": ""}"#)
                .unwrap();
        assert_eq!(never_toggled.enabled_at, None);
    }
}
