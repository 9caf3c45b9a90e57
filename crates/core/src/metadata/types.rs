//! Metadata search types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the metadata service.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// Transport failure or non-success status after retries.
    #[error("metadata query failed: {0}")]
    Query(String),

    /// Response could not be decoded.
    #[error("invalid metadata response: {0}")]
    InvalidResponse(String),
}

/// Query template derived from a task table alternative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMetadataQuery {
    /// Deduplication key shared with identical alternatives.
    pub key: String,
    pub retrieval_mode: String,
    pub delta_time0: f64,
    pub delta_time1: f64,
    pub product_type: String,
    pub product_family: String,
}

impl SearchMetadataQuery {
    pub fn to_log_message(&self) -> String {
        format!(
            "{} ({}, dt0={}, dt1={})",
            self.product_type, self.retrieval_mode, self.delta_time0, self.delta_time1
        )
    }
}

/// Job-specific parameters of a metadata search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub satellite_id: String,
    pub instrument_config_id: Option<i32>,
    pub process_mode: Option<String>,
    pub polarisation: Option<String>,
}

/// A file descriptor returned by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    pub product_name: String,
    pub product_type: String,
    pub key_object_storage: String,
    pub validity_start: DateTime<Utc>,
    pub validity_stop: DateTime<Utc>,
    #[serde(default)]
    pub mission_id: Option<String>,
    #[serde(default)]
    pub satellite_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionFileType {
    Raw,
    /// Session descriptor (DSIB) of one channel.
    Session,
}

/// A file of an EDRS downlink session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFile {
    pub product_name: String,
    pub key_object_storage: String,
    pub session_id: String,
    pub channel_id: u8,
    pub product_type: SessionFileType,
    /// Raw files announced by a descriptor. Empty for raws.
    #[serde(default)]
    pub raw_names: Vec<String>,
}

/// Client for the metadata search service.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Search files matching `query` around the job window.
    async fn search(
        &self,
        query: &SearchMetadataQuery,
        params: &SearchParams,
    ) -> Result<Vec<SearchMetadata>, MetadataError>;

    /// Every catalogued file of a downlink session, both channels.
    async fn session_files(&self, session_id: &str) -> Result<Vec<SessionFile>, MetadataError>;
}

/// Timestamp format expected by the metadata service.
pub const METADATA_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_metadata_date(date: &DateTime<Utc>) -> String {
    date.format(METADATA_DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_metadata_date() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_metadata_date(&date), "2024-03-01T12:30:05.000000Z");
    }

    #[test]
    fn test_search_metadata_wire_format() {
        let json = r#"{
            "productName": "S1A_AUX_CAL_V20190228T092500_G20190227T103000.SAFE",
            "productType": "AUX_CAL",
            "keyObjectStorage": "S1A_AUX_CAL_V20190228T092500_G20190227T103000.SAFE",
            "validityStart": "2019-02-28T09:25:00Z",
            "validityStop": "9999-12-31T23:59:59Z"
        }"#;
        let parsed: SearchMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.product_type, "AUX_CAL");
        assert!(parsed.mission_id.is_none());
    }

    #[test]
    fn test_session_file_wire_format() {
        let json = r#"{
            "productName": "DCS_02_L20191022_ch1_DSIB.xml",
            "keyObjectStorage": "L20191022/ch01/DCS_02_L20191022_ch1_DSIB.xml",
            "sessionId": "L20191022",
            "channelId": 1,
            "productType": "SESSION",
            "rawNames": ["DCS_02_L20191022_ch1_DSDB_00001.raw"]
        }"#;
        let parsed: SessionFile = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.product_type, SessionFileType::Session);
        assert_eq!(parsed.channel_id, 1);
        assert_eq!(parsed.raw_names.len(), 1);

        let raw: SessionFile = serde_json::from_str(
            r#"{"productName": "a.raw", "keyObjectStorage": "a.raw", "sessionId": "L1",
                "channelId": 2, "productType": "RAW"}"#,
        )
        .unwrap();
        assert_eq!(raw.product_type, SessionFileType::Raw);
        assert!(raw.raw_names.is_empty());
    }
}
