//! Loads task tables from a directory of TOML documents.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use super::{TaskTable, TaskTableAdapter, TaskTableError};

/// Task table name for a document file stem (`TaskTable.L0ASP` -> `TaskTable.L0ASP.xml`).
pub fn task_table_name(stem: &str) -> String {
    format!("{}.xml", stem)
}

/// Parse and validate one task table.
pub fn parse_task_table(name: &str, content: &str) -> Result<TaskTableAdapter, TaskTableError> {
    let table: TaskTable = toml::from_str(content).map_err(|e| TaskTableError::Parse {
        table: name.to_string(),
        reason: e.to_string(),
    })?;
    TaskTableAdapter::new(name, table)
}

/// Load every `*.toml` task table in `dir`, keyed by task table name.
pub fn load_task_tables(dir: &Path) -> Result<BTreeMap<String, TaskTableAdapter>, TaskTableError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| TaskTableError::Io(format!("{}: {}", dir.display(), e)))?;

    let mut tables = BTreeMap::new();
    for entry in entries {
        let path = entry
            .map_err(|e| TaskTableError::Io(e.to_string()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let name = task_table_name(stem);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| TaskTableError::Io(format!("{}: {}", path.display(), e)))?;
        let adapter = parse_task_table(&name, &content)?;
        debug!(
            "Loaded task table {} ({} inputs)",
            name,
            adapter.inputs().len()
        );
        tables.insert(name, adapter);
    }

    info!("Loaded {} task tables from {}", tables.len(), dir.display());
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const L0ASP: &str = r#"
processor_name = "L0_ASP"
version = "3.40"

[[pools]]
[[pools.tasks]]
name = "AspTask"
version = "3.40"
binary_path = "/usr/local/components/asp"

[[pools.tasks.inputs]]
id = "cal"
mandatory = true

[[pools.tasks.inputs.alternatives]]
origin = "DB"
retrieval_mode = "LatestValCover"
file_type = "AUX_CAL"
file_name_type = "PHYSICAL"

[[pools.tasks.outputs]]
file_type = "SM_RAW__0S"
file_name_type = "DIRECTORY"
destination = "DB"
"#;

    #[test]
    fn test_parse_task_table() {
        let adapter = parse_task_table("TaskTable.L0ASP.xml", L0ASP).unwrap();
        assert_eq!(adapter.processor_name(), "L0_ASP");
        assert_eq!(adapter.inputs().len(), 1);
        assert_eq!(adapter.tasks().count(), 1);
    }

    #[test]
    fn test_parse_error() {
        let result = parse_task_table("bad.xml", "processor_name = ");
        assert!(matches!(result, Err(TaskTableError::Parse { .. })));
    }

    #[test]
    fn test_load_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("TaskTable.L0ASP.toml"), L0ASP).unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let tables = load_task_tables(dir.path()).unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables.contains_key("TaskTable.L0ASP.xml"));
    }

    #[test]
    fn test_load_missing_directory() {
        let result = load_task_tables(Path::new("/nonexistent/tasktables"));
        assert!(matches!(result, Err(TaskTableError::Io(_))));
    }
}
