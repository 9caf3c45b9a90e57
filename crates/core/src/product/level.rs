use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::job::{format_job_order_date, CatalogEvent, Generation, Job, ResolvedFile};

use super::{PrimaryCheckError, ProductTypeAdapter};

/// One job per product; the triggering product is the primary input.
#[derive(Debug, Default)]
pub struct LevelProductAdapter;

impl LevelProductAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProductTypeAdapter for LevelProductAdapter {
    fn name(&self) -> &str {
        "level_product"
    }

    fn association_key(&self, event: &CatalogEvent) -> Result<String, PrimaryCheckError> {
        Ok(event.product_name.clone())
    }

    async fn main_input_search(
        &self,
        job: &mut Job,
        _generation: &Generation,
        _now: DateTime<Utc>,
    ) -> Result<(), PrimaryCheckError> {
        let product = &mut job.product;
        if product.primary_files.is_empty() {
            debug!(job_id = job.id, "Primary input is {}", product.product_name);
            product.primary_files.push(ResolvedFile {
                name: product.product_name.clone(),
                key_object_storage: product.key_object_storage.clone(),
                start: format_job_order_date(&product.start_time),
                stop: format_job_order_date(&product.stop_time),
            });
        }
        Ok(())
    }
}
