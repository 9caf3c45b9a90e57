//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the external service traits,
//! allowing generation lifecycle tests without a metadata service or a bus.
//! Jobs are kept in [`crate::catalog::SqliteJobCatalog::in_memory`].
//!
//! # Example
//!
//! ```rust,ignore
//! use jobgen_core::testing::{fixtures, MockMessageBus, MockMetadataClient};
//!
//! let metadata = MockMetadataClient::new();
//! let bus = MockMessageBus::new();
//!
//! metadata.add_file("AUX_CAL", "S1A_AUX_CAL_V20190228T092500.SAFE").await;
//! let adapter = fixtures::l0asp_adapter();
//! ```

mod mock_bus;
mod mock_metadata;

pub use mock_bus::MockMessageBus;
pub use mock_metadata::{MockMetadataClient, RecordedMetadataSearch};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::job::{
        CatalogEvent, CatalogEventMessage, Generation, Job, JobProduct, JobState, NewJob,
        ResolvedInputSet,
    };
    use crate::metadata::SearchMetadata;
    use crate::product::{
        DATATAKE_ID, MISSION_ID, POLARISATION, PROCESS_MODE, SATELLITE_ID, SESSION_ID,
        STATION_CODE, START_TIME, STOP_TIME, SWATH_TYPE,
    };
    use crate::tasktable::{
        Alternative, Destination, FileNameType, Input, InputMode, Origin, Output, Pool, Task,
        TaskTable, TaskTableAdapter,
    };

    static COUNTER: AtomicU64 = AtomicU64::new(1);

    fn next_id() -> u64 {
        COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    pub const L0ASP: &str = "TaskTable.L0ASP.xml";

    /// Product with a ten minute window ending an hour before `now`.
    pub fn product(product_type: &str, now: DateTime<Utc>) -> JobProduct {
        let name = format!("S1A_{}_{:06}", product_type, next_id());
        JobProduct {
            product_name: name.clone(),
            product_type: product_type.to_string(),
            family: "L0_SEGMENT".to_string(),
            key_object_storage: name,
            start_time: now - Duration::minutes(70),
            stop_time: now - Duration::minutes(60),
            satellite_id: "A".to_string(),
            mission_id: "S1".to_string(),
            acquisition: Some("IW".to_string()),
            process_mode: Some("NOMINAL".to_string()),
            instrument_config_id: None,
            polarisation: Some("DV".to_string()),
            timeliness: None,
            primary_files: Vec::new(),
            station_code: None,
            channel_raws: Default::default(),
        }
    }

    /// Catalog event of an L0 segment.
    pub fn segment_event(product_name: &str, datatake_id: &str) -> CatalogEvent {
        let metadata: BTreeMap<String, serde_json::Value> = [
            (START_TIME, "2024-03-01T10:00:00Z"),
            (STOP_TIME, "2024-03-01T10:10:00Z"),
            (SATELLITE_ID, "A"),
            (MISSION_ID, "S1"),
            (DATATAKE_ID, datatake_id),
            (SWATH_TYPE, "IW"),
            (PROCESS_MODE, "NOMINAL"),
            (POLARISATION, "DV"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();

        CatalogEvent {
            product_name: product_name.to_string(),
            product_type: "IW_RAW__0S".to_string(),
            product_family: "L0_SEGMENT".to_string(),
            key_object_storage: product_name.to_string(),
            metadata,
        }
    }

    /// Catalog event of an EDRS session descriptor.
    pub fn session_event(session_id: &str, station_code: &str) -> CatalogEvent {
        let metadata: BTreeMap<String, serde_json::Value> = [
            (START_TIME, "2024-03-01T10:00:00Z"),
            (STOP_TIME, "2024-03-01T10:12:00Z"),
            (SATELLITE_ID, "A"),
            (MISSION_ID, "S1"),
            (SESSION_ID, session_id),
            (STATION_CODE, station_code),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();

        CatalogEvent {
            product_name: format!("DCS_{}_ch1_DSIB.xml", session_id),
            product_type: "SESSION".to_string(),
            product_family: "EDRS_SESSION".to_string(),
            key_object_storage: format!("{}/ch01/DCS_{}_ch1_DSIB.xml", session_id, session_id),
            metadata,
        }
    }

    pub fn message(id: u64, event: CatalogEvent) -> CatalogEventMessage {
        CatalogEventMessage {
            id,
            input_key: "catalog-event".to_string(),
            body: event,
        }
    }

    /// Job creation request with one message and INITIAL generations.
    pub fn new_job(pod: &str, task_tables: &[&str]) -> NewJob {
        let now = Utc::now();
        let product = product("IW_RAW__0S", now);
        let event = segment_event(&product.product_name, &product.product_name);
        NewJob {
            pod: pod.to_string(),
            level: "L0_SEGMENT".to_string(),
            association_key: product.product_name.clone(),
            product,
            messages: vec![message(next_id(), event)],
            generations: task_tables
                .iter()
                .map(|tt| Generation::initial(*tt, now))
                .collect(),
            inputs: task_tables
                .iter()
                .map(|tt| ResolvedInputSet::new(*tt, Vec::new()))
                .collect(),
        }
    }

    /// Persisted-looking job.
    pub fn job(id: i64, pod: &str, task_tables: &[&str], now: DateTime<Utc>) -> Job {
        let new_job = new_job(pod, task_tables);
        Job {
            id,
            pod: new_job.pod,
            level: new_job.level,
            association_key: new_job.association_key,
            state: JobState::Generating,
            product: new_job.product,
            messages: new_job.messages,
            generations: task_tables
                .iter()
                .map(|tt| Generation::initial(*tt, now))
                .collect(),
            inputs: new_job.inputs,
            created_at: now,
            last_update: now,
        }
    }

    pub fn search_metadata(product_type: &str, product_name: &str) -> SearchMetadata {
        SearchMetadata {
            product_name: product_name.to_string(),
            product_type: product_type.to_string(),
            key_object_storage: product_name.to_string(),
            validity_start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            validity_stop: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
            mission_id: Some("S1".to_string()),
            satellite_id: Some("A".to_string()),
        }
    }

    fn db_alternative(file_type: &str) -> Alternative {
        Alternative {
            order: None,
            origin: Origin::Db,
            retrieval_mode: "LatestValCover".to_string(),
            delta_time0: 0.0,
            delta_time1: 0.0,
            file_type: file_type.to_string(),
            file_name_type: FileNameType::Physical,
        }
    }

    /// L0 ASP task table: mandatory AUX_CAL, optional AUX_INS.
    pub fn l0asp_task_table() -> TaskTable {
        TaskTable {
            processor_name: "L0_ASP".to_string(),
            version: "3.40".to_string(),
            pools: vec![Pool {
                tasks: vec![Task {
                    name: "L0AspProcessor".to_string(),
                    version: "3.40".to_string(),
                    binary_path: "/usr/local/components/L0ASP/bin/L0AspProcessor".to_string(),
                    inputs: vec![
                        Input {
                            id: Some("aux_cal".to_string()),
                            reference: None,
                            mode: InputMode::Always,
                            mandatory: true,
                            alternatives: vec![db_alternative("AUX_CAL")],
                        },
                        Input {
                            id: Some("aux_ins".to_string()),
                            reference: None,
                            mode: InputMode::Always,
                            mandatory: false,
                            alternatives: vec![db_alternative("AUX_INS")],
                        },
                    ],
                    outputs: vec![Output {
                        file_type: "IW_RAW__0A".to_string(),
                        file_name_type: FileNameType::Directory,
                        destination: Destination::Db,
                        mandatory: true,
                    }],
                }],
            }],
        }
    }

    pub fn l0asp_adapter() -> TaskTableAdapter {
        // Fixture tables are valid by construction.
        TaskTableAdapter::new(L0ASP, l0asp_task_table()).unwrap()
    }
}
