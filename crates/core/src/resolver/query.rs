//! Query templates derived from task table alternatives.

use std::collections::BTreeMap;

use crate::job::{format_job_order_date, JobProduct, ResolvedFile, ResolvedInputSet};
use crate::metadata::{SearchMetadata, SearchMetadataQuery, SearchParams};
use crate::tasktable::{Alternative, Origin, ProductMode, TaskTableAdapter};

/// Family of inputs produced by an earlier task of the same job.
pub const TIME_DERIVED_FAMILY: &str = "BLANK";

/// File type to family lookup.
#[derive(Debug, Clone, Default)]
pub struct Families {
    pub default_family: String,
    pub by_file_type: BTreeMap<String, String>,
    /// Task table file type to the type the catalog knows it under.
    pub type_meta: BTreeMap<String, String>,
}

impl Families {
    pub fn new(default_family: impl Into<String>, by_file_type: BTreeMap<String, String>) -> Self {
        Self {
            default_family: default_family.into(),
            by_file_type,
            type_meta: BTreeMap::new(),
        }
    }

    pub fn with_type_meta(mut self, type_meta: BTreeMap<String, String>) -> Self {
        self.type_meta = type_meta;
        self
    }

    pub fn family(&self, file_type: &str) -> &str {
        self.by_file_type
            .get(file_type)
            .map(String::as_str)
            .unwrap_or(&self.default_family)
    }

    pub fn meta_type<'a>(&'a self, file_type: &'a str) -> &'a str {
        self.type_meta
            .get(file_type)
            .map(String::as_str)
            .unwrap_or(file_type)
    }
}

pub fn query_for(alternative: &Alternative, families: &Families) -> SearchMetadataQuery {
    let product_type = families.meta_type(&alternative.file_type);
    SearchMetadataQuery {
        key: alternative.dedup_key(),
        retrieval_mode: alternative.retrieval_mode.clone(),
        delta_time0: alternative.delta_time0,
        delta_time1: alternative.delta_time1,
        product_type: product_type.to_string(),
        product_family: families.family(product_type).to_string(),
    }
}

/// Unique searchable queries of the inputs still missing in `set`.
pub fn pending_queries(
    adapter: &TaskTableAdapter,
    set: &ResolvedInputSet,
    mode: ProductMode,
    families: &Families,
) -> BTreeMap<String, SearchMetadataQuery> {
    let mut queries = BTreeMap::new();
    for adapted in adapter.inputs_for(mode) {
        if adapted.input.reference.is_some() {
            continue;
        }
        if set.input(&adapted.reference).is_some_and(|i| i.has_result) {
            continue;
        }
        for alternative in adapted.input.alternatives.iter().filter(|a| a.origin == Origin::Db) {
            queries
                .entry(alternative.dedup_key())
                .or_insert_with(|| query_for(alternative, families));
        }
    }
    queries
}

/// Polarisation code understood by the AUX_ECE search.
pub fn ece_polarisation(polarisation: Option<&str>) -> &'static str {
    match polarisation {
        Some("SV") | Some("DV") => "V",
        Some("SH") | Some("DH") => "H",
        _ => "NONE",
    }
}

pub fn search_params(product: &JobProduct, query: &SearchMetadataQuery) -> SearchParams {
    let polarisation = if query.product_type == "AUX_ECE" {
        Some(ece_polarisation(product.polarisation.as_deref()).to_string())
    } else {
        None
    };
    SearchParams {
        start: product.start_time,
        stop: product.stop_time,
        satellite_id: product.satellite_id.clone(),
        instrument_config_id: product.instrument_config_id,
        process_mode: product.process_mode.clone(),
        polarisation,
    }
}

pub fn file_from_metadata(metadata: &SearchMetadata) -> ResolvedFile {
    ResolvedFile {
        name: metadata.product_name.clone(),
        key_object_storage: metadata.key_object_storage.clone(),
        start: format_job_order_date(&metadata.validity_start),
        stop: format_job_order_date(&metadata.validity_stop),
    }
}

/// File produced by an earlier task over the job window, named as a pattern.
pub fn file_from_product_window(
    alternative: &Alternative,
    product: &JobProduct,
    families: &Families,
) -> ResolvedFile {
    ResolvedFile {
        name: families.meta_type(&alternative.file_type).to_string(),
        key_object_storage: String::new(),
        start: format_job_order_date(&product.start_time),
        stop: format_job_order_date(&product.stop_time),
    }
}
