//! Product type adapters: job association and the primary input pre-check.

mod level;
mod segment;
mod session;

pub use level::LevelProductAdapter;
pub use segment::L0SegmentAdapter;
pub use session::{EdrsSessionAdapter, EDRS_SESSION_FAMILY};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{CatalogEvent, Generation, Job, JobProduct};
use crate::metadata::MetadataError;

#[derive(Debug, Clone, Error)]
pub enum PrimaryCheckError {
    #[error("event for {product} has no {key} metadata")]
    MissingMetadata { product: String, key: String },

    #[error("event for {product} has invalid {key} metadata: {reason}")]
    InvalidMetadata {
        product: String,
        key: String,
        reason: String,
    },

    /// Primary input not yet available, retried later.
    #[error("primary input missing for {0}")]
    PrimaryMissing(String),

    #[error("primary input search failed: {0}")]
    Metadata(#[from] MetadataError),
}

/// A primary file to download into the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInput {
    pub family: String,
    /// Path below the work directory.
    pub relative_path: String,
    pub key_object_storage: String,
}

/// Primary files of `product`, downloaded under the product family.
pub fn primary_files_as_inputs(product: &JobProduct) -> Vec<PrimaryInput> {
    product
        .primary_files
        .iter()
        .map(|file| PrimaryInput {
            family: product.family.clone(),
            relative_path: file.name.clone(),
            key_object_storage: file.key_object_storage.clone(),
        })
        .collect()
}

/// Product type specific behaviour of a worker.
#[async_trait]
pub trait ProductTypeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Key shared by all events that belong to the same job.
    fn association_key(&self, event: &CatalogEvent) -> Result<String, PrimaryCheckError>;

    fn build_product(&self, event: &CatalogEvent) -> Result<JobProduct, PrimaryCheckError> {
        product_from_event(event)
    }

    /// Fold a later event of the same job into its product. Nothing by default.
    fn merge_event(
        &self,
        _product: &mut JobProduct,
        _event: &CatalogEvent,
    ) -> Result<(), PrimaryCheckError> {
        Ok(())
    }

    /// Stage action of INITIAL -> PRIMARY_CHECK. Updates the job's product in place.
    async fn main_input_search(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), PrimaryCheckError>;

    /// Primary inputs of the execution job, ahead of the resolved inputs.
    fn primary_inputs(&self, product: &JobProduct) -> Vec<PrimaryInput> {
        primary_files_as_inputs(product)
    }
}

// Catalog event metadata keys.
pub const START_TIME: &str = "startTime";
pub const STOP_TIME: &str = "stopTime";
pub const SATELLITE_ID: &str = "satelliteId";
pub const MISSION_ID: &str = "missionId";
pub const PROCESS_MODE: &str = "processMode";
pub const INSTRUMENT_CONFIG_ID: &str = "instrumentConfigurationId";
pub const POLARISATION: &str = "polarisation";
pub const TIMELINESS: &str = "timeliness";
pub const SWATH_TYPE: &str = "swathtype";
pub const DATATAKE_ID: &str = "datatakeId";
pub const SESSION_ID: &str = "sessionId";
pub const STATION_CODE: &str = "stationCode";

/// Job product descriptor from the event metadata.
pub fn product_from_event(event: &CatalogEvent) -> Result<JobProduct, PrimaryCheckError> {
    let instrument_config_id = match event.metadata.get(INSTRUMENT_CONFIG_ID) {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(parse_int(event, INSTRUMENT_CONFIG_ID, value)?),
    };

    Ok(JobProduct {
        product_name: event.product_name.clone(),
        product_type: event.product_type.clone(),
        family: event.product_family.clone(),
        key_object_storage: event.key_object_storage.clone(),
        start_time: required_date(event, START_TIME)?,
        stop_time: required_date(event, STOP_TIME)?,
        satellite_id: event.metadata_str(SATELLITE_ID).unwrap_or_default().to_string(),
        mission_id: event.metadata_str(MISSION_ID).unwrap_or_default().to_string(),
        acquisition: event.metadata_str(SWATH_TYPE).map(String::from),
        process_mode: event.metadata_str(PROCESS_MODE).map(String::from),
        instrument_config_id,
        polarisation: event.metadata_str(POLARISATION).map(String::from),
        timeliness: event.metadata_str(TIMELINESS).map(String::from),
        primary_files: Vec::new(),
        station_code: None,
        channel_raws: Default::default(),
    })
}

pub(crate) fn required_str<'a>(
    event: &'a CatalogEvent,
    key: &str,
) -> Result<&'a str, PrimaryCheckError> {
    event
        .metadata_str(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PrimaryCheckError::MissingMetadata {
            product: event.product_name.clone(),
            key: key.to_string(),
        })
}

fn required_date(event: &CatalogEvent, key: &str) -> Result<DateTime<Utc>, PrimaryCheckError> {
    let value = required_str(event, key)?;
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PrimaryCheckError::InvalidMetadata {
            product: event.product_name.clone(),
            key: key.to_string(),
            reason: e.to_string(),
        })
}

fn parse_int(
    event: &CatalogEvent,
    key: &str,
    value: &serde_json::Value,
) -> Result<i32, PrimaryCheckError> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| PrimaryCheckError::InvalidMetadata {
        product: event.product_name.clone(),
        key: key.to_string(),
        reason: format!("not an integer: {}", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_product_from_event() {
        let mut event = fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-1");
        event
            .metadata
            .insert(INSTRUMENT_CONFIG_ID.to_string(), serde_json::json!(6));
        event
            .metadata
            .insert(POLARISATION.to_string(), serde_json::json!("DV"));

        let product = product_from_event(&event).unwrap();
        assert_eq!(product.product_name, "S1A_IW_RAW__0S_0001");
        assert_eq!(product.instrument_config_id, Some(6));
        assert_eq!(product.polarisation.as_deref(), Some("DV"));
        assert_eq!(product.satellite_id, "A");
        assert!(product.start_time < product.stop_time);
        assert!(product.primary_files.is_empty());
    }

    #[test]
    fn test_instrument_config_as_string() {
        let mut event = fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-1");
        event
            .metadata
            .insert(INSTRUMENT_CONFIG_ID.to_string(), serde_json::json!("7"));
        assert_eq!(product_from_event(&event).unwrap().instrument_config_id, Some(7));

        event
            .metadata
            .insert(INSTRUMENT_CONFIG_ID.to_string(), serde_json::json!("x"));
        assert!(matches!(
            product_from_event(&event),
            Err(PrimaryCheckError::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn test_missing_start_time() {
        let mut event = fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-1");
        event.metadata.remove(START_TIME);
        assert!(matches!(
            product_from_event(&event),
            Err(PrimaryCheckError::MissingMetadata { .. })
        ));
    }
}
