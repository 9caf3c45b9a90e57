//! Input resolution against the metadata service.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::job::{Generation, Job, JobProduct, ResolvedInput, ResolvedInputSet};
use crate::metadata::MetadataClient;
use crate::metrics::{INPUTS_TIMED_OUT, METADATA_QUERIES};
use crate::tasktable::{AdaptedInput, FileNameType, Origin, ProductMode, TaskTableAdapter};

use super::query::{
    file_from_metadata, file_from_product_window, pending_queries, search_params, Families,
    TIME_DERIVED_FAMILY,
};
use super::{Resolution, ResolveError};

/// Resolves task table inputs of a job, one generation at a time.
pub struct InputResolver {
    metadata: Arc<dyn MetadataClient>,
    families: Families,
    timeouts: super::InputTimeoutChecker,
}

impl InputResolver {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        families: Families,
        timeouts: super::InputTimeoutChecker,
    ) -> Self {
        Self {
            metadata,
            families,
            timeouts,
        }
    }

    /// Resolve what is still missing and merge the result into `job`.
    ///
    /// Optional input waiting times are measured from `generation.state_since`.
    pub async fn resolve(
        &self,
        job: &mut Job,
        adapter: &TaskTableAdapter,
        mode: ProductMode,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Resolution {
        let mut set = job
            .inputs_for(adapter.name())
            .cloned()
            .unwrap_or_else(|| ResolvedInputSet::new(adapter.name(), Vec::new()));
        ensure_placeholders(&mut set, adapter, mode);

        self.run_queries(&mut set, &job.product, adapter, mode).await;

        let outcome = self.select(&mut set, &job.product, adapter, mode, generation, now);
        *job.inputs_for_mut(adapter.name()) = set;
        outcome
    }

    /// Issue every pending query that has no memoized non-empty result.
    ///
    /// Queries run concurrently; a failed one is left absent for the next pass.
    async fn run_queries(
        &self,
        set: &mut ResolvedInputSet,
        product: &JobProduct,
        adapter: &TaskTableAdapter,
        mode: ProductMode,
    ) {
        let pending: Vec<_> = pending_queries(adapter, set, mode, &self.families)
            .into_iter()
            .filter(|(key, _)| {
                let cached = set.queries.contains_key(key);
                if cached {
                    METADATA_QUERIES.with_label_values(&["cached"]).inc();
                }
                !cached
            })
            .collect();

        let searches = pending.iter().map(|(_, query)| {
            let params = search_params(product, query);
            async move { self.metadata.search(query, &params).await }
        });
        let results = futures::future::join_all(searches).await;

        for ((key, query), result) in pending.into_iter().zip(results) {
            match result {
                Ok(results) if results.is_empty() => {
                    METADATA_QUERIES.with_label_values(&["empty"]).inc();
                    debug!("No result for {}", query.to_log_message());
                }
                Ok(results) => {
                    METADATA_QUERIES.with_label_values(&["found"]).inc();
                    debug!("{} result(s) for {}", results.len(), query.to_log_message());
                    set.queries.insert(key, results);
                }
                Err(e) => {
                    METADATA_QUERIES.with_label_values(&["error"]).inc();
                    warn!("Metadata query {} failed: {}", query.to_log_message(), e);
                }
            }
        }
    }

    fn select(
        &self,
        set: &mut ResolvedInputSet,
        product: &JobProduct,
        adapter: &TaskTableAdapter,
        mode: ProductMode,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Resolution {
        let mut resolved: BTreeMap<String, ResolvedInput> = set
            .inputs
            .iter()
            .filter(|i| i.has_result)
            .map(|i| (i.reference.clone(), i.clone()))
            .collect();

        let pending: Vec<&AdaptedInput> = adapter
            .inputs_for(mode)
            .filter(|i| !resolved.contains_key(&i.reference))
            .collect();

        // First pass in declaration order, references to unresolved inputs are deferred.
        let mut deferred = Vec::new();
        for adapted in &pending {
            match adapted.input.reference.as_deref() {
                Some(target) => match resolved.get(target) {
                    Some(found) => {
                        let copy = found.referenced_as(&adapted.reference, adapted.input.mandatory);
                        resolved.insert(adapted.reference.clone(), copy);
                    }
                    None => deferred.push(*adapted),
                },
                None => {
                    if let Some(input) = self.select_alternative(adapted, set, product) {
                        resolved.insert(adapted.reference.clone(), input);
                    }
                }
            }
        }

        // Second pass: targets declared later are resolved by now. A target still
        // without result leaves the reference missing.
        for adapted in deferred {
            let Some(target) = adapted.input.reference.as_deref() else {
                continue;
            };
            if let Some(found) = resolved.get(target) {
                let copy = found.referenced_as(&adapted.reference, adapted.input.mandatory);
                resolved.insert(adapted.reference.clone(), copy);
            } else if adapter
                .input(target)
                .is_some_and(|t| !mode.is_compatible_with(t.input.mode))
            {
                return Resolution::Failed {
                    cause: ResolveError::DanglingReference {
                        input: adapted.reference.clone(),
                        target: target.to_string(),
                    },
                };
            }
        }

        let mut missing = Vec::new();
        for adapted in &pending {
            if resolved.contains_key(&adapted.reference) {
                continue;
            }
            if !adapted.input.mandatory
                && self.timeouts.is_timed_out(
                    adapter.processor_name(),
                    adapter.version(),
                    &adapted.reference,
                    generation.state_since,
                    now,
                )
            {
                info!(
                    task_table = adapter.name(),
                    "Optional input {} timed out, dropping it", adapted.reference
                );
                INPUTS_TIMED_OUT.inc();
                resolved.insert(
                    adapted.reference.clone(),
                    ResolvedInput {
                        has_result: true,
                        timed_out: true,
                        ..ResolvedInput::pending(&adapted.reference, false)
                    },
                );
                continue;
            }
            missing.push(adapted.reference.clone());
        }

        set.merge(resolved.into_values().collect());

        if missing.is_empty() {
            Resolution::Complete
        } else {
            Resolution::Incomplete { missing }
        }
    }

    /// First alternative, by ascending order, with a non-empty result.
    fn select_alternative(
        &self,
        adapted: &AdaptedInput,
        set: &ResolvedInputSet,
        product: &JobProduct,
    ) -> Option<ResolvedInput> {
        adapted.sorted_alternatives().into_iter().find_map(|alternative| {
            if alternative.origin == Origin::Proc {
                return Some(ResolvedInput {
                    reference: adapted.reference.clone(),
                    file_type: alternative.file_type.clone(),
                    file_name_type: FileNameType::Regexp,
                    family: TIME_DERIVED_FAMILY.to_string(),
                    mandatory: adapted.input.mandatory,
                    has_result: true,
                    timed_out: false,
                    time_derived: true,
                    files: vec![file_from_product_window(alternative, product, &self.families)],
                });
            }
            let files: Vec<_> = set
                .queries
                .get(&alternative.dedup_key())
                .filter(|results| !results.is_empty())?
                .iter()
                .map(file_from_metadata)
                .collect();
            Some(ResolvedInput {
                reference: adapted.reference.clone(),
                file_type: alternative.file_type.clone(),
                file_name_type: alternative.file_name_type,
                family: self.families.family(&alternative.file_type).to_string(),
                mandatory: adapted.input.mandatory,
                has_result: true,
                timed_out: false,
                time_derived: false,
                files,
            })
        })
    }
}

/// Add a pending entry for every applicable input the set does not know yet.
fn ensure_placeholders(set: &mut ResolvedInputSet, adapter: &TaskTableAdapter, mode: ProductMode) {
    for placeholder in adapter.initial_inputs(mode) {
        if set.input(&placeholder.reference).is_none() {
            set.inputs.push(placeholder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::InputTimeoutChecker;
    use crate::tasktable::{Alternative, FileNameType, Input, InputMode, Pool, Task, TaskTable};
    use crate::testing::{fixtures, MockMetadataClient};

    fn alt(file_type: &str, order: Option<u32>) -> Alternative {
        Alternative {
            order,
            origin: Origin::Db,
            retrieval_mode: "LatestValCover".to_string(),
            delta_time0: 0.0,
            delta_time1: 0.0,
            file_type: file_type.to_string(),
            file_name_type: FileNameType::Physical,
        }
    }

    fn input(id: &str, mandatory: bool, alternatives: Vec<Alternative>) -> Input {
        Input {
            id: Some(id.to_string()),
            reference: None,
            mode: InputMode::Always,
            mandatory,
            alternatives,
        }
    }

    fn reference(id: &str, target: &str) -> Input {
        Input {
            id: Some(id.to_string()),
            reference: Some(target.to_string()),
            mode: InputMode::Always,
            mandatory: true,
            alternatives: vec![],
        }
    }

    fn adapter(inputs: Vec<Input>) -> TaskTableAdapter {
        TaskTableAdapter::new(
            "TaskTable.L0ASP.xml",
            TaskTable {
                processor_name: "L0_ASP".to_string(),
                version: "3.40".to_string(),
                pools: vec![Pool {
                    tasks: vec![Task {
                        name: "AspTask".to_string(),
                        version: "3.40".to_string(),
                        binary_path: "/usr/bin/asp".to_string(),
                        inputs,
                        outputs: vec![],
                    }],
                }],
            },
        )
        .unwrap()
    }

    fn resolver(metadata: &MockMetadataClient) -> InputResolver {
        InputResolver::new(
            Arc::new(metadata.clone()),
            Families::new("AUXILIARY_FILE", BTreeMap::new()),
            InputTimeoutChecker::immediate(),
        )
    }

    fn job_for(adapter: &TaskTableAdapter) -> (Job, Generation) {
        let now = Utc::now();
        let job = fixtures::job(1, "pod-1", &[adapter.name()], now);
        let generation = job.generations[0].clone();
        (job, generation)
    }

    #[tokio::test]
    async fn test_complete_resolution() {
        let metadata = MockMetadataClient::new();
        metadata.add_file("AUX_CAL", "S1A_AUX_CAL_V20190228.SAFE").await;
        let adapter = adapter(vec![input("cal", true, vec![alt("AUX_CAL", None)])]);
        let (mut job, generation) = job_for(&adapter);

        let outcome = resolver(&metadata)
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert_eq!(outcome, Resolution::Complete);
        let set = job.inputs_for(adapter.name()).unwrap();
        let cal = set.input("cal").unwrap();
        assert!(cal.has_result);
        assert_eq!(cal.family, "AUXILIARY_FILE");
        assert_eq!(cal.files[0].name, "S1A_AUX_CAL_V20190228.SAFE");
        assert_eq!(set.queries.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_mandatory_is_incomplete() {
        let metadata = MockMetadataClient::new();
        let adapter = adapter(vec![input("cal", true, vec![alt("AUX_CAL", None)])]);
        let (mut job, generation) = job_for(&adapter);

        let outcome = resolver(&metadata)
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert_eq!(
            outcome,
            Resolution::Incomplete {
                missing: vec!["cal".to_string()]
            }
        );
        assert!(job.inputs_for(adapter.name()).unwrap().queries.is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_is_not_fatal() {
        let metadata = MockMetadataClient::new();
        metadata.add_file("AUX_CAL", "S1A_AUX_CAL.SAFE").await;
        metadata.set_fail_next(1).await;
        let adapter = adapter(vec![input("cal", true, vec![alt("AUX_CAL", None)])]);
        let (mut job, generation) = job_for(&adapter);
        let resolver = resolver(&metadata);

        let first = resolver
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;
        assert!(matches!(first, Resolution::Incomplete { .. }));

        let second = resolver
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;
        assert_eq!(second, Resolution::Complete);
    }

    #[tokio::test]
    async fn test_shared_query_issued_once() {
        let metadata = MockMetadataClient::new();
        metadata.add_file("AUX_CAL", "S1A_AUX_CAL.SAFE").await;
        let adapter = adapter(vec![
            input("cal_a", true, vec![alt("AUX_CAL", None)]),
            input("cal_b", true, vec![alt("AUX_CAL", None)]),
        ]);
        let (mut job, generation) = job_for(&adapter);

        let outcome = resolver(&metadata)
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert_eq!(outcome, Resolution::Complete);
        assert_eq!(metadata.search_count().await, 1);
    }

    #[tokio::test]
    async fn test_time_derived_alternative_needs_no_query() {
        let metadata = MockMetadataClient::new();
        let mut proc_alt = alt("MPL_TIMELINE", None);
        proc_alt.origin = Origin::Proc;
        let adapter = adapter(vec![input("timeline", true, vec![proc_alt])]);
        let (mut job, generation) = job_for(&adapter);

        let outcome = resolver(&metadata)
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert_eq!(outcome, Resolution::Complete);
        assert_eq!(metadata.search_count().await, 0);
        let timeline = job.inputs_for(adapter.name()).unwrap().input("timeline").unwrap();
        assert!(timeline.time_derived);
        assert_eq!(timeline.family, TIME_DERIVED_FAMILY);
        assert_eq!(timeline.file_name_type, FileNameType::Regexp);
        assert_eq!(timeline.files.len(), 1);
        assert_eq!(timeline.files[0].name, "MPL_TIMELINE");
        assert!(timeline.files[0].key_object_storage.is_empty());
    }

    #[tokio::test]
    async fn test_time_derived_file_named_from_type_meta() {
        let metadata = MockMetadataClient::new();
        let mut proc_alt = alt("MPL_TIMELINE", None);
        proc_alt.origin = Origin::Proc;
        let adapter = adapter(vec![input("timeline", true, vec![proc_alt])]);
        let (mut job, generation) = job_for(&adapter);
        let resolver = InputResolver::new(
            Arc::new(metadata.clone()),
            Families::new(
                "AUXILIARY_FILE",
                [("MPL_TIMELINE".to_string(), "AUXILIARY_FILE".to_string())].into(),
            )
            .with_type_meta(
                [("MPL_TIMELINE".to_string(), "S1A_OPER_MPL_TIMELINE.*".to_string())].into(),
            ),
            InputTimeoutChecker::immediate(),
        );

        let outcome = resolver
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert_eq!(outcome, Resolution::Complete);
        let timeline = job.inputs_for(adapter.name()).unwrap().input("timeline").unwrap();
        assert_eq!(timeline.family, "BLANK");
        assert_eq!(timeline.file_type, "MPL_TIMELINE");
        assert_eq!(timeline.files[0].name, "S1A_OPER_MPL_TIMELINE.*");
    }

    #[tokio::test]
    async fn test_reference_to_inapplicable_input_fails() {
        let metadata = MockMetadataClient::new();
        let mut slicing_only = input("sliced", true, vec![alt("AUX_CAL", None)]);
        slicing_only.mode = InputMode::Slicing;
        let adapter = adapter(vec![slicing_only, reference("copy", "sliced")]);
        let (mut job, generation) = job_for(&adapter);

        let outcome = resolver(&metadata)
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert!(matches!(
            outcome,
            Resolution::Failed {
                cause: ResolveError::DanglingReference { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_reference_to_unresolved_input_is_retried() {
        let metadata = MockMetadataClient::new();
        let adapter = adapter(vec![
            reference("copy", "cal"),
            input("cal", true, vec![alt("AUX_CAL", None)]),
        ]);
        let (mut job, generation) = job_for(&adapter);
        let resolver = resolver(&metadata);

        let outcome = resolver
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;
        let Resolution::Incomplete { missing } = outcome else {
            panic!("expected missing inputs, got {:?}", outcome);
        };
        assert!(missing.contains(&"copy".to_string()));
        assert!(missing.contains(&"cal".to_string()));

        metadata.add_file("AUX_CAL", "S1A_AUX_CAL.SAFE").await;
        let outcome = resolver
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;
        assert_eq!(outcome, Resolution::Complete);
        let copy = job.inputs_for(adapter.name()).unwrap().input("copy").unwrap();
        assert_eq!(copy.files[0].name, "S1A_AUX_CAL.SAFE");
    }

    #[tokio::test]
    async fn test_optional_input_dropped_without_waiting_rule() {
        let metadata = MockMetadataClient::new();
        metadata.add_file("AUX_CAL", "S1A_AUX_CAL.SAFE").await;
        let adapter = adapter(vec![
            input("cal", true, vec![alt("AUX_CAL", None)]),
            input("ins", false, vec![alt("AUX_INS", None)]),
        ]);
        let (mut job, generation) = job_for(&adapter);

        let outcome = resolver(&metadata)
            .resolve(&mut job, &adapter, ProductMode::NonSlicing, &generation, Utc::now())
            .await;

        assert_eq!(outcome, Resolution::Complete);
        let ins = job.inputs_for(adapter.name()).unwrap().input("ins").cloned().unwrap();
        assert!(ins.has_result);
        assert!(ins.timed_out);
        assert!(ins.files.is_empty());
    }
}
