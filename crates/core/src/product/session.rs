use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::job::{format_job_order_date, CatalogEvent, Generation, Job, JobProduct, ResolvedFile};
use crate::metadata::{MetadataClient, SessionFile, SessionFileType};

use super::{
    product_from_event, required_str, PrimaryCheckError, PrimaryInput, ProductTypeAdapter,
    SESSION_ID, STATION_CODE,
};

/// Family of the raw channel files of a session.
pub const EDRS_SESSION_FAMILY: &str = "EDRS_SESSION";

const CHANNELS: [u8; 2] = [1, 2];

/// One job per EDRS downlink session.
///
/// The pre-check waits for the descriptor (DSIB) of both channels and for every raw
/// they announce. Once the primary search timeout elapsed since the generation was
/// created, whatever was found is accepted.
pub struct EdrsSessionAdapter {
    metadata: Arc<dyn MetadataClient>,
    /// Zero waits forever.
    primary_search_timeout: Duration,
}

impl EdrsSessionAdapter {
    pub fn new(metadata: Arc<dyn MetadataClient>, primary_search_timeout_secs: u64) -> Self {
        Self {
            metadata,
            primary_search_timeout: Duration::seconds(primary_search_timeout_secs as i64),
        }
    }

    fn timed_out(&self, generation: &Generation, now: DateTime<Utc>) -> bool {
        self.primary_search_timeout > Duration::zero()
            && now - generation.creation_date >= self.primary_search_timeout
    }
}

/// Catalogued files of one session.
struct SessionListing<'a> {
    files: &'a [SessionFile],
}

impl<'a> SessionListing<'a> {
    fn dsib(&self, channel: u8) -> Option<&'a SessionFile> {
        self.files
            .iter()
            .find(|f| f.channel_id == channel && f.product_type == SessionFileType::Session)
    }

    fn raws(&self, channel: u8) -> impl Iterator<Item = &'a SessionFile> + 'a {
        self.files
            .iter()
            .filter(move |f| f.channel_id == channel && f.product_type == SessionFileType::Raw)
    }

    /// Raws of the channel, restricted to those its DSIB announces when there is one.
    fn channel_raws(&self, channel: u8) -> Vec<&'a SessionFile> {
        let announced: Option<BTreeSet<&str>> = self
            .dsib(channel)
            .map(|dsib| dsib.raw_names.iter().map(String::as_str).collect());
        let mut raws: Vec<_> = self
            .raws(channel)
            .filter(|raw| {
                announced
                    .as_ref()
                    .is_none_or(|names| names.contains(raw.product_name.as_str()))
            })
            .collect();
        raws.sort_by(|a, b| a.product_name.cmp(&b.product_name));
        raws.dedup_by(|a, b| a.product_name == b.product_name);
        raws
    }

    /// Raws announced by a DSIB and not catalogued yet, as `ch0N/name`.
    fn missing_raws(&self) -> Vec<String> {
        CHANNELS
            .iter()
            .filter_map(|&channel| self.dsib(channel).map(|dsib| (channel, dsib)))
            .flat_map(|(channel, dsib)| {
                let present: BTreeSet<&str> =
                    self.raws(channel).map(|r| r.product_name.as_str()).collect();
                dsib.raw_names
                    .iter()
                    .filter(move |name| !present.contains(name.as_str()))
                    .map(move |name| format!("{}{}", channel_dir(channel), name))
            })
            .collect()
    }
}

fn channel_dir(channel: u8) -> String {
    format!("ch{:02}/", channel)
}

fn raw_file(raw: &SessionFile, product: &JobProduct) -> ResolvedFile {
    ResolvedFile {
        name: raw.product_name.clone(),
        key_object_storage: raw.key_object_storage.clone(),
        start: format_job_order_date(&product.start_time),
        stop: format_job_order_date(&product.stop_time),
    }
}

#[async_trait]
impl ProductTypeAdapter for EdrsSessionAdapter {
    fn name(&self) -> &str {
        "edrs_session"
    }

    fn association_key(&self, event: &CatalogEvent) -> Result<String, PrimaryCheckError> {
        required_str(event, SESSION_ID).map(String::from)
    }

    /// The session id stands in for the product name so executions can find the session.
    fn build_product(&self, event: &CatalogEvent) -> Result<JobProduct, PrimaryCheckError> {
        let mut product = product_from_event(event)?;
        product.product_name = required_str(event, SESSION_ID)?.to_string();
        product.station_code = event.metadata_str(STATION_CODE).map(String::from);
        Ok(product)
    }

    async fn main_input_search(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), PrimaryCheckError> {
        let session_id = job.product.product_name.clone();
        let timed_out = self.timed_out(generation, now);

        let files = match self.metadata.session_files(&session_id).await {
            Ok(files) => files,
            Err(e) if timed_out => {
                warn!(
                    job_id = job.id,
                    "Primary search timed out, starting session {} without listing: {}",
                    session_id,
                    e
                );
                return Ok(());
            }
            Err(e) => {
                return Err(PrimaryCheckError::PrimaryMissing(format!(
                    "query error for session {}: {}",
                    session_id, e
                )))
            }
        };
        let listing = SessionListing { files: &files };

        for channel in CHANNELS {
            let raws = listing
                .channel_raws(channel)
                .into_iter()
                .map(|raw| raw_file(raw, &job.product))
                .collect();
            job.product.channel_raws.insert(channel, raws);
            if listing.dsib(channel).is_none() && !timed_out {
                return Err(PrimaryCheckError::PrimaryMissing(format!(
                    "no DSIB for channel {} of session {}",
                    channel, session_id
                )));
            }
        }

        let missing = listing.missing_raws();
        if !missing.is_empty() {
            if !timed_out {
                return Err(PrimaryCheckError::PrimaryMissing(format!(
                    "session {} misses {} raw(s): {}",
                    session_id,
                    missing.len(),
                    missing.join(", ")
                )));
            }
            warn!(
                job_id = job.id,
                "Primary search timed out, session {} starts without {} raw(s)",
                session_id,
                missing.len()
            );
        }

        info!(
            job_id = job.id,
            "Session {} complete with {} raw(s)",
            session_id,
            job.product.channel_raws.values().map(Vec::len).sum::<usize>()
        );
        Ok(())
    }

    /// Raws alternate between channels, each in name order.
    fn primary_inputs(&self, product: &JobProduct) -> Vec<PrimaryInput> {
        let empty = Vec::new();
        let ch1 = product.channel_raws.get(&1).unwrap_or(&empty);
        let ch2 = product.channel_raws.get(&2).unwrap_or(&empty);

        let mut inputs = Vec::with_capacity(ch1.len() + ch2.len());
        for i in 0..ch1.len().max(ch2.len()) {
            for (channel, raws) in [(1, ch1), (2, ch2)] {
                if let Some(raw) = raws.get(i) {
                    inputs.push(PrimaryInput {
                        family: EDRS_SESSION_FAMILY.to_string(),
                        relative_path: format!("{}{}", channel_dir(channel), raw.name),
                        key_object_storage: raw.key_object_storage.clone(),
                    });
                }
            }
        }
        inputs
    }
}
