//! SQLite-backed job catalog.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::job::{GenerationUpdate, Job, JobPatch, JobState, NewJob};

use super::{apply_generation_update, apply_job_patch, CatalogError, JobCatalog, JobFilter};

const JOB_COLUMNS: &str = "id, pod, level, association_key, state, product, messages, generations, inputs, created_at, last_update";

/// Single-node catalog storing nested job parts as JSON columns.
pub struct SqliteJobCatalog {
    conn: Mutex<Connection>,
}

impl SqliteJobCatalog {
    /// Open or create the database file.
    pub fn new(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path).map_err(db_error)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), CatalogError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pod TEXT NOT NULL,
                level TEXT NOT NULL,
                association_key TEXT NOT NULL,
                product_name TEXT NOT NULL,
                state TEXT NOT NULL,
                product TEXT NOT NULL,
                messages TEXT NOT NULL,
                generations TEXT NOT NULL,
                inputs TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_update TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_pod ON jobs(pod);
            CREATE INDEX IF NOT EXISTS idx_jobs_association_key ON jobs(association_key);
            CREATE INDEX IF NOT EXISTS idx_jobs_product_name ON jobs(product_name);
            "#,
        )
        .map_err(db_error)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CatalogError> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::Database("connection lock poisoned".to_string()))
    }

    fn build_query(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref pod) = filter.pod {
            conditions.push("pod = ?".to_string());
            params.push(Box::new(pod.clone()));
        }

        if let Some(ref key) = filter.association_key {
            conditions.push("association_key = ?".to_string());
            params.push(Box::new(key.clone()));
        }

        if let Some(ref product_name) = filter.product_name {
            conditions.push("product_name = ?".to_string());
            params.push(Box::new(product_name.clone()));
        }

        if let Some(message_id) = filter.message_id {
            conditions.push(
                "EXISTS (SELECT 1 FROM json_each(jobs.messages) m WHERE json_extract(m.value, '$.id') = ?)"
                    .to_string(),
            );
            params.push(Box::new(message_id as i64));
        }

        let order_by = match filter.task_table {
            Some(ref task_table) => {
                let mut generation_match =
                    "json_extract(g.value, '$.task_table') = ?".to_string();
                params.push(Box::new(task_table.clone()));
                if let Some(state) = filter.exclude_state {
                    generation_match.push_str(" AND json_extract(g.value, '$.state') != ?");
                    params.push(Box::new(state.as_str().to_string()));
                }
                conditions.push(format!(
                    "EXISTS (SELECT 1 FROM json_each(jobs.generations) g WHERE {})",
                    generation_match
                ));
                params.push(Box::new(task_table.clone()));
                "(SELECT julianday(json_extract(g.value, '$.last_update')) FROM json_each(jobs.generations) g WHERE json_extract(g.value, '$.task_table') = ?) ASC, id ASC"
            }
            None => "julianday(last_update) ASC, id ASC",
        };

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        params.push(Box::new(filter.limit));
        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY {} LIMIT ?",
            JOB_COLUMNS, where_clause, order_by
        );
        (sql, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let state: String = row.get(4)?;
        Ok(Job {
            id: row.get(0)?,
            pod: row.get(1)?,
            level: row.get(2)?,
            association_key: row.get(3)?,
            state: parse_json_column(4, &format!("\"{}\"", state))?,
            product: parse_json_column(5, &row.get::<_, String>(5)?)?,
            messages: parse_json_column(6, &row.get::<_, String>(6)?)?,
            generations: parse_json_column(7, &row.get::<_, String>(7)?)?,
            inputs: parse_json_column(8, &row.get::<_, String>(8)?)?,
            created_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
            last_update: parse_timestamp(10, &row.get::<_, String>(10)?)?,
        })
    }

    fn load(conn: &Connection, id: i64) -> Result<Option<Job>, CatalogError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_error)
    }

    fn store(conn: &Connection, job: &Job) -> Result<(), CatalogError> {
        conn.execute(
            "UPDATE jobs SET state = ?, product = ?, product_name = ?, messages = ?, generations = ?, inputs = ?, last_update = ? WHERE id = ?",
            params![
                job_state_str(job.state),
                to_json(&job.product)?,
                job.product.product_name,
                to_json(&job.messages)?,
                to_json(&job.generations)?,
                to_json(&job.inputs)?,
                job.last_update.to_rfc3339(),
                job.id,
            ],
        )
        .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl JobCatalog for SqliteJobCatalog {
    async fn search(&self, filter: &JobFilter) -> Result<Vec<Job>, CatalogError> {
        let conn = self.lock()?;
        let (sql, params) = Self::build_query(filter);
        let mut stmt = conn.prepare(&sql).map_err(db_error)?;

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_error)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.map_err(db_error)?);
        }
        Ok(jobs)
    }

    async fn get(&self, id: i64) -> Result<Option<Job>, CatalogError> {
        let conn = self.lock()?;
        Self::load(&conn, id)
    }

    async fn create(&self, job: NewJob) -> Result<Job, CatalogError> {
        let conn = self.lock()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO jobs (pod, level, association_key, product_name, state, product, messages, generations, inputs, created_at, last_update) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                job.pod,
                job.level,
                job.association_key,
                job.product.product_name,
                job_state_str(JobState::Generating),
                to_json(&job.product)?,
                to_json(&job.messages)?,
                to_json(&job.generations)?,
                to_json(&job.inputs)?,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(db_error)?;

        Ok(Job {
            id: conn.last_insert_rowid(),
            pod: job.pod,
            level: job.level,
            association_key: job.association_key,
            state: JobState::Generating,
            product: job.product,
            messages: job.messages,
            generations: job.generations,
            inputs: job.inputs,
            created_at: now,
            last_update: now,
        })
    }

    async fn patch(&self, id: i64, patch: &JobPatch) -> Result<Job, CatalogError> {
        let conn = self.lock()?;
        let mut stored = Self::load(&conn, id)?.ok_or(CatalogError::NotFound(id))?;
        apply_job_patch(&mut stored, patch, Utc::now());
        Self::store(&conn, &stored)?;
        Ok(stored)
    }

    async fn patch_generation_state(
        &self,
        id: i64,
        task_table: &str,
        update: &GenerationUpdate,
    ) -> Result<Job, CatalogError> {
        let conn = self.lock()?;
        let mut stored = Self::load(&conn, id)?.ok_or(CatalogError::NotFound(id))?;
        apply_generation_update(&mut stored, task_table, update, Utc::now())?;
        // The connection lock serializes writers, the version check above is the CAS.
        Self::store(&conn, &stored)?;
        Ok(stored)
    }
}

fn db_error(e: rusqlite::Error) -> CatalogError {
    CatalogError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CatalogError> {
    serde_json::to_string(value).map_err(|e| CatalogError::Database(e.to_string()))
}

fn job_state_str(state: JobState) -> &'static str {
    match state {
        JobState::Generating => "GENERATING",
        JobState::Terminated => "TERMINATED",
    }
}

fn parse_json_column<T: DeserializeOwned>(idx: usize, json: &str) -> rusqlite::Result<T> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
