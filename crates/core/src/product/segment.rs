use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::job::{CatalogEvent, Generation, Job, JobProduct};
use crate::metadata::{MetadataClient, SearchMetadata, SearchMetadataQuery, SearchParams};
use crate::resolver::Families;

use super::{required_str, PrimaryCheckError, ProductTypeAdapter, DATATAKE_ID};

const SEGMENT_RETRIEVAL_MODE: &str = "ValIntersect";

/// Groups L0 segments of a datatake into one job.
///
/// The pre-check waits until the segments found over the job window cover it without
/// gaps. Once the primary search timeout elapsed since the generation was created,
/// whatever was found is accepted.
pub struct L0SegmentAdapter {
    metadata: Arc<dyn MetadataClient>,
    families: Families,
    /// Zero waits forever.
    primary_search_timeout: Duration,
}

impl L0SegmentAdapter {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        families: Families,
        primary_search_timeout_secs: u64,
    ) -> Self {
        Self {
            metadata,
            families,
            primary_search_timeout: Duration::seconds(primary_search_timeout_secs as i64),
        }
    }

    fn timed_out(&self, generation: &Generation, now: DateTime<Utc>) -> bool {
        self.primary_search_timeout > Duration::zero()
            && now - generation.creation_date >= self.primary_search_timeout
    }
}

/// True when `segments` cover `[start, stop]` without gaps.
fn covers(segments: &[SearchMetadata], start: DateTime<Utc>, stop: DateTime<Utc>) -> bool {
    let mut sorted: Vec<&SearchMetadata> = segments.iter().collect();
    sorted.sort_by_key(|s| s.validity_start);

    let mut covered_until = match sorted.first() {
        Some(first) if first.validity_start <= start => first.validity_stop,
        _ => return false,
    };
    for segment in sorted.iter().skip(1) {
        if segment.validity_start > covered_until {
            return false;
        }
        covered_until = covered_until.max(segment.validity_stop);
    }
    covered_until >= stop
}

#[async_trait]
impl ProductTypeAdapter for L0SegmentAdapter {
    fn name(&self) -> &str {
        "l0_segment"
    }

    fn association_key(&self, event: &CatalogEvent) -> Result<String, PrimaryCheckError> {
        required_str(event, DATATAKE_ID).map(String::from)
    }

    /// Widen the job window with the segment carried by `event`.
    fn merge_event(
        &self,
        product: &mut JobProduct,
        event: &CatalogEvent,
    ) -> Result<(), PrimaryCheckError> {
        let segment = self.build_product(event)?;
        product.start_time = product.start_time.min(segment.start_time);
        product.stop_time = product.stop_time.max(segment.stop_time);
        Ok(())
    }

    async fn main_input_search(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), PrimaryCheckError> {
        let product = &job.product;
        let query = SearchMetadataQuery {
            key: format!("{}|segments", product.product_type),
            retrieval_mode: SEGMENT_RETRIEVAL_MODE.to_string(),
            delta_time0: 0.0,
            delta_time1: 0.0,
            product_type: product.product_type.clone(),
            product_family: self.families.family(&product.product_type).to_string(),
        };
        let params = SearchParams {
            start: product.start_time,
            stop: product.stop_time,
            satellite_id: product.satellite_id.clone(),
            instrument_config_id: product.instrument_config_id,
            process_mode: product.process_mode.clone(),
            polarisation: None,
        };

        let segments = self.metadata.search(&query, &params).await?;
        if segments.is_empty() {
            return Err(PrimaryCheckError::PrimaryMissing(format!(
                "no segment for {}",
                job.association_key
            )));
        }

        let complete = covers(&segments, product.start_time, product.stop_time);
        if !complete {
            if !self.timed_out(generation, now) {
                return Err(PrimaryCheckError::PrimaryMissing(format!(
                    "segments of {} do not cover the datatake yet ({} found)",
                    job.association_key,
                    segments.len()
                )));
            }
            warn!(
                job_id = job.id,
                "Primary search timed out, using {} segment(s) found for {}",
                segments.len(),
                job.association_key
            );
        }

        let product = &mut job.product;
        for segment in &segments {
            product.start_time = product.start_time.min(segment.validity_start);
            product.stop_time = product.stop_time.max(segment.validity_stop);
        }
        product.primary_files = segments
            .iter()
            .map(crate::resolver::file_from_metadata)
            .collect();

        info!(
            job_id = job.id,
            "Found {} segment(s) for datatake {}",
            segments.len(),
            job.association_key
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, MockMetadataClient};

    fn adapter(metadata: &MockMetadataClient, timeout_secs: u64) -> L0SegmentAdapter {
        L0SegmentAdapter::new(
            Arc::new(metadata.clone()),
            Families::new("L0_SEGMENT", Default::default()),
            timeout_secs,
        )
    }

    fn segment(name: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> SearchMetadata {
        SearchMetadata {
            product_name: name.to_string(),
            product_type: "IW_RAW__0S".to_string(),
            key_object_storage: name.to_string(),
            validity_start: start,
            validity_stop: stop,
            mission_id: Some("S1".to_string()),
            satellite_id: Some("A".to_string()),
        }
    }

    fn segment_job(now: DateTime<Utc>) -> (Job, Generation) {
        let mut job = fixtures::job(1, "pod-1", &["TaskTable.L0ASP.xml"], now);
        job.product.product_type = "IW_RAW__0S".to_string();
        job.association_key = "dt-1".to_string();
        let generation = job.generations[0].clone();
        (job, generation)
    }

    #[tokio::test]
    async fn test_no_segment_fails() {
        let metadata = MockMetadataClient::new();
        let now = Utc::now();
        let (mut job, generation) = segment_job(now);

        let result = adapter(&metadata, 0)
            .main_input_search(&mut job, &generation, now)
            .await;
        assert!(matches!(result, Err(PrimaryCheckError::PrimaryMissing(_))));
    }

    #[tokio::test]
    async fn test_covering_segments_widen_window() {
        let metadata = MockMetadataClient::new();
        let now = Utc::now();
        let (mut job, generation) = segment_job(now);
        let start = job.product.start_time;
        let stop = job.product.stop_time;

        metadata
            .add_result(
                "IW_RAW__0S",
                segment("seg-1", start - Duration::seconds(10), start + Duration::seconds(30)),
            )
            .await;
        metadata
            .add_result(
                "IW_RAW__0S",
                segment("seg-2", start + Duration::seconds(20), stop + Duration::seconds(5)),
            )
            .await;

        adapter(&metadata, 0)
            .main_input_search(&mut job, &generation, now)
            .await
            .unwrap();

        assert_eq!(job.product.primary_files.len(), 2);
        assert_eq!(job.product.start_time, start - Duration::seconds(10));
        assert_eq!(job.product.stop_time, stop + Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_gap_waits_until_timeout() {
        let metadata = MockMetadataClient::new();
        let now = Utc::now();
        let (mut job, generation) = segment_job(now);
        let start = job.product.start_time;
        metadata
            .add_result(
                "IW_RAW__0S",
                segment("seg-1", start, start + Duration::seconds(1)),
            )
            .await;

        let adapter = adapter(&metadata, 120);
        let early = adapter.main_input_search(&mut job, &generation, now).await;
        assert!(matches!(early, Err(PrimaryCheckError::PrimaryMissing(_))));

        let late = now + Duration::seconds(120);
        adapter
            .main_input_search(&mut job, &generation, late)
            .await
            .unwrap();
        assert_eq!(job.product.primary_files.len(), 1);
    }

    #[test]
    fn test_merge_event_widens_window() {
        let metadata = MockMetadataClient::new();
        let event = fixtures::segment_event("S1A_IW_RAW__0S_0002", "dt-1");
        let mut product = crate::product::product_from_event(&event).unwrap();
        let start = product.start_time;
        product.start_time = start + Duration::minutes(5);
        product.stop_time = start + Duration::minutes(30);

        adapter(&metadata, 0).merge_event(&mut product, &event).unwrap();

        assert_eq!(product.start_time, start);
        assert_eq!(product.stop_time, start + Duration::minutes(30));
    }

    #[test]
    fn test_association_key_requires_datatake() {
        let metadata = MockMetadataClient::new();
        let mut event = fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-9");
        assert_eq!(adapter(&metadata, 0).association_key(&event).unwrap(), "dt-9");
        event.metadata.remove(DATATAKE_ID);
        assert!(adapter(&metadata, 0).association_key(&event).is_err());
    }
}
