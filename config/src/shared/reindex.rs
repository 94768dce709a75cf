use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{BatchConfig, PgConnectionConfig, RetryConfig, ValidationError};

/// Top-level configuration of the reindex pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReindexConfig {
    pub pg_connection: PgConnectionConfig,
    /// Suffix appended to a tenant id to form its schema, e.g. `diku` -> `diku_mod_search`.
    #[serde(default = "default_schema_suffix")]
    pub schema_suffix: String,
    /// Tenants whose schemas are migrated and served by this process.
    #[serde(default)]
    pub tenants: Vec<String>,
    /// Tenant whose schema holds the shared tables. Defaults to the first entry of `tenants`.
    #[serde(default)]
    pub central_tenant: Option<String>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub sub_resources: SubResourcesConfig,
    /// Soft-deletes merge target rows instead of removing them, so incremental consumers
    /// observe the deletion.
    #[serde(default)]
    pub instance_children_index_enabled: bool,
}

impl ReindexConfig {
    pub const DEFAULT_SCHEMA_SUFFIX: &'static str = "mod_search";

    /// Returns the tenant owning the shared tables, if any tenant is configured.
    pub fn data_tenant(&self) -> Option<&str> {
        self.central_tenant
            .as_deref()
            .or_else(|| self.tenants.first().map(String::as_str))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pg_connection.validate()?;

        let suffix_is_valid = !self.schema_suffix.is_empty()
            && self
                .schema_suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !suffix_is_valid {
            return Err(ValidationError::InvalidSchemaSuffix(
                self.schema_suffix.clone(),
            ));
        }

        self.batch.validate()?;
        self.merge.validate()?;
        self.upload.validate()?;
        self.sub_resources.validate()
    }
}

impl Config for ReindexConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["tenants"];
}

fn default_schema_suffix() -> String {
    ReindexConfig::DEFAULT_SCHEMA_SUFFIX.to_string()
}

/// Merge phase settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MergeConfig {
    /// Number of id ranges the keyspace of each (entity type, tenant) is split into.
    #[serde(default = "default_range_count")]
    pub range_count: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl MergeConfig {
    pub const DEFAULT_RANGE_COUNT: u32 = 16;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.range_count == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "merge.range_count".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        self.retry.validate()
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            range_count: default_range_count(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_range_count() -> u32 {
    MergeConfig::DEFAULT_RANGE_COUNT
}

/// Upload phase settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UploadConfig {
    /// Rows per upload range.
    #[serde(default = "default_range_size")]
    pub range_size: u32,
}

impl UploadConfig {
    pub const DEFAULT_RANGE_SIZE: u32 = 1_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.range_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "upload.range_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            range_size: default_range_size(),
        }
    }
}

fn default_range_size() -> u32 {
    UploadConfig::DEFAULT_RANGE_SIZE
}

/// Background sub-resource aggregation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubResourcesConfig {
    /// Page size of each timestamp-cursor fetch.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
    /// Age after which a held lock is considered abandoned, in milliseconds.
    #[serde(default = "default_stale_lock_threshold_ms")]
    pub stale_lock_threshold_ms: u64,
    /// Pause between two aggregation cycles of a worker, in milliseconds.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Window below the watermark that every cycle reads again, in milliseconds.
    ///
    /// Entity timestamps are transaction start times, so a row can become visible after a
    /// cycle already moved the watermark past it.
    #[serde(default = "default_watermark_overlap_ms")]
    pub watermark_overlap_ms: u64,
}

impl SubResourcesConfig {
    pub const DEFAULT_FETCH_LIMIT: u32 = 500;

    /// Default stale lock threshold: 10 minutes.
    pub const DEFAULT_STALE_LOCK_THRESHOLD_MS: u64 = 600_000;

    pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 60_000;

    pub const DEFAULT_WATERMARK_OVERLAP_MS: u64 = 5_000;

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fetch_limit == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sub_resources.fetch_limit".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.stale_lock_threshold_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sub_resources.stale_lock_threshold_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.sync_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "sub_resources.sync_interval_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for SubResourcesConfig {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            stale_lock_threshold_ms: default_stale_lock_threshold_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            watermark_overlap_ms: default_watermark_overlap_ms(),
        }
    }
}

fn default_fetch_limit() -> u32 {
    SubResourcesConfig::DEFAULT_FETCH_LIMIT
}

fn default_stale_lock_threshold_ms() -> u64 {
    SubResourcesConfig::DEFAULT_STALE_LOCK_THRESHOLD_MS
}

fn default_sync_interval_ms() -> u64 {
    SubResourcesConfig::DEFAULT_SYNC_INTERVAL_MS
}

fn default_watermark_overlap_ms() -> u64 {
    SubResourcesConfig::DEFAULT_WATERMARK_OVERLAP_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::TlsConfig;

    fn config() -> ReindexConfig {
        ReindexConfig {
            pg_connection: PgConnectionConfig {
                host: "localhost".to_string(),
                port: 5432,
                name: "folio".to_string(),
                username: "postgres".to_string(),
                password: None,
                tls: TlsConfig {
                    trusted_root_certs: String::new(),
                    enabled: false,
                },
            },
            schema_suffix: default_schema_suffix(),
            tenants: vec!["diku".to_string()],
            central_tenant: None,
            batch: BatchConfig::default(),
            merge: MergeConfig::default(),
            upload: UploadConfig::default(),
            sub_resources: SubResourcesConfig::default(),
            instance_children_index_enabled: false,
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn schema_suffix_must_be_a_plain_identifier() {
        let mut config = config();
        config.schema_suffix = "mod-search; drop".to_string();

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidSchemaSuffix(_))
        ));
    }

    #[test]
    fn zero_range_count_is_rejected() {
        let mut config = config();
        config.merge.range_count = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_attempts_are_rejected() {
        let mut config = config();
        config.merge.retry.max_attempts = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn sections_fall_back_to_defaults_when_omitted() {
        let config: ReindexConfig = serde_json::from_str(
            r#"{"pg_connection": {"host": "db", "port": 5432, "name": "folio",
                "username": "folio", "tls": {"trusted_root_certs": "", "enabled": false}}}"#,
        )
        .unwrap();

        assert_eq!(config.schema_suffix, "mod_search");
        assert_eq!(config.upload.range_size, UploadConfig::DEFAULT_RANGE_SIZE);
        assert_eq!(config.merge.retry.max_attempts, RetryConfig::DEFAULT_MAX_ATTEMPTS);
        assert!(!config.instance_children_index_enabled);
        assert_eq!(config.data_tenant(), None);
    }

    #[test]
    fn data_tenant_defaults_to_the_first_tenant() {
        let mut config = config();
        assert_eq!(config.data_tenant(), Some("diku"));

        config.central_tenant = Some("consortium".to_string());
        assert_eq!(config.data_tenant(), Some("consortium"));
    }
}
