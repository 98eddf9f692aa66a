//! Configuration for ThreatMap services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`THREATMAP__` prefix, `__` separator,
//!    e.g. `THREATMAP__NEO4J__URI`)
//! 2. Config file (`threatmap.toml`, or any prefix passed to [`AppConfig::load`])
//! 3. Defaults

use serde::Deserialize;

use crate::error::ThreatMapError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub schema: SchemaSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub neo4j: Neo4jSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
}

impl AppConfig {
    /// Load from `<file_prefix>.{toml,json,yaml}` (optional) overlaid with
    /// `THREATMAP__` environment variables.
    pub fn load(file_prefix: &str) -> Result<Self, ThreatMapError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("THREATMAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: AppConfig = cfg.try_deserialize()?;
        tracing::debug!(
            schema = %loaded.schema.path,
            backend = ?loaded.store.backend,
            "Configuration loaded"
        );
        Ok(loaded)
    }
}

/// `[schema]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaSettings {
    /// Path to the schema JSON document.
    #[serde(default = "default_schema_path")]
    pub path: String,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            path: default_schema_path(),
        }
    }
}

/// Which graph store backs the engine.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store. Contents are lost on exit unless exported.
    #[default]
    Memory,
    Neo4j,
}

/// `[store]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
}

/// `[neo4j]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jSettings {
    #[serde(default = "default_neo4j_uri")]
    pub uri: String,
    #[serde(default = "default_neo4j_user")]
    pub user: String,
    #[serde(default = "default_neo4j_password")]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            uri: default_neo4j_uri(),
            user: default_neo4j_user(),
            password: default_neo4j_password(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

/// `[ingest]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    /// Batches ingested concurrently by the CLI.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Attempts per batch when the store reports transient failures.
    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_concurrent_batches: default_max_concurrent_batches(),
            storage_retries: default_storage_retries(),
        }
    }
}

fn default_schema_path() -> String {
    "schema/threat_map.json".to_string()
}

fn default_neo4j_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_neo4j_user() -> String {
    "neo4j".to_string()
}

fn default_neo4j_password() -> String {
    "threatmap-dev".to_string()
}

fn default_max_connections() -> usize {
    16
}

fn default_fetch_size() -> usize {
    500
}

fn default_max_concurrent_batches() -> usize {
    4
}

fn default_storage_retries() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("absent");
        let cfg = AppConfig::load(prefix.to_str().unwrap()).unwrap();

        assert_eq!(cfg.schema.path, "schema/threat_map.json");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.neo4j.uri, "bolt://localhost:7687");
        assert_eq!(cfg.ingest.max_concurrent_batches, 4);
        assert_eq!(cfg.ingest.storage_retries, 3);
    }

    #[test]
    fn reads_sections_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threatmap.toml");
        std::fs::write(
            &path,
            r#"
[schema]
path = "/etc/threatmap/schema.json"

[store]
backend = "neo4j"

[neo4j]
uri = "bolt://graph:7687"
password = "secret"

[ingest]
max_concurrent_batches = 8
"#,
        )
        .unwrap();

        let prefix = dir.path().join("threatmap");
        let cfg = AppConfig::load(prefix.to_str().unwrap()).unwrap();

        assert_eq!(cfg.schema.path, "/etc/threatmap/schema.json");
        assert_eq!(cfg.store.backend, StoreBackend::Neo4j);
        assert_eq!(cfg.neo4j.uri, "bolt://graph:7687");
        assert_eq!(cfg.neo4j.user, "neo4j");
        assert_eq!(cfg.neo4j.password, "secret");
        assert_eq!(cfg.ingest.max_concurrent_batches, 8);
        assert_eq!(cfg.ingest.storage_retries, 3);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "[store\nbackend = ").unwrap();

        let prefix = dir.path().join("broken");
        let err = AppConfig::load(prefix.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ThreatMapError::Config(_)));
    }
}
