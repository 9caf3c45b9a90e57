use regex_lite::Regex;

use super::{types::Config, CatalogBackend, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Every configured regex compiles
/// - The http catalog backend has a URL
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.catalog.backend == CatalogBackend::Http && config.catalog.url.is_none() {
        return Err(ConfigError::ValidationError(
            "catalog.url is required for the http backend".to_string(),
        ));
    }

    for waiting in &config.input_waiting {
        check_regex("input_waiting.processor_name_regexp", &waiting.processor_name_regexp)?;
        check_regex(
            "input_waiting.processor_version_regexp",
            &waiting.processor_version_regexp,
        )?;
        check_regex("input_waiting.input_id_regexp", &waiting.input_id_regexp)?;
    }

    for rule in &config.routing {
        check_regex("routing.product_type", &rule.product_type)?;
        if rule.task_tables.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "routing for {} names no task table",
                rule.product_type
            )));
        }
    }

    for consumer in &config.consumers {
        if let Some(ref pattern) = consumer.filter.match_regex {
            check_regex("consumers.filter.match_regex", pattern)?;
        }
    }

    Ok(())
}

/// Check the routing against the loaded task tables.
pub fn validate_task_tables<'a>(
    config: &Config,
    loaded: impl IntoIterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let loaded: Vec<&str> = loaded.into_iter().collect();
    if loaded.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "no task table found in {}",
            config.worker.tasktable_dir.display()
        )));
    }

    for rule in &config.routing {
        for task_table in &rule.task_tables {
            if !loaded.contains(&task_table.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "routing for {} targets unknown task table {}",
                    rule.product_type, task_table
                )));
            }
        }
    }
    Ok(())
}

fn check_regex(field: &str, pattern: &str) -> Result<(), ConfigError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ConfigError::ValidationError(format!("{} '{}': {}", field, pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config_from_str, RoutingRule};

    fn config() -> Config {
        load_config_from_str(
            r#"
[worker]
level = "L0_SEGMENT"
tasktable_dir = "/app/tasktables"

[metadata]
url = "http://metadata:8080"

[bus]
url = "http://bus:8080"

[[routing]]
product_type = ".*_RAW__0S"
task_tables = ["TaskTable.L0ASP.xml"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&config()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = config();
        config.server.port = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_bad_regex_fails() {
        let mut config = config();
        config.routing.push(RoutingRule {
            product_type: "(unclosed".to_string(),
            task_tables: vec!["TaskTable.L0ASP.xml".to_string()],
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_http_catalog_requires_url() {
        let mut config = config();
        config.catalog.backend = CatalogBackend::Http;
        assert!(validate_config(&config).is_err());
        config.catalog.url = Some("http://catalog:8080".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_task_tables() {
        let config = config();
        assert!(validate_task_tables(&config, ["TaskTable.L0ASP.xml"]).is_ok());
        assert!(validate_task_tables(&config, ["TaskTable.AIOP.xml"]).is_err());
        assert!(validate_task_tables(&config, std::iter::empty()).is_err());
    }
}
