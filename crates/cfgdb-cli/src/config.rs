use std::path::Path;

use anyhow::Context;
use cfgdb_audit::AuditConfig;
use cfgdb_store::StoreConfig;
use serde::{Deserialize, Serialize};

/// Settings file of `cfgdb-manage`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManageConfig {
    pub store: StoreConfig,
    pub audit: AuditConfig,
}

impl ManageConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfgdb_store::StoreBackend;

    #[test]
    fn empty_file_gives_defaults() {
        let config: ManageConfig = toml::from_str("").unwrap();
        assert_eq!(config, ManageConfig::default());
    }

    #[test]
    fn load_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manage.toml");
        std::fs::write(
            &path,
            r#"
                [store]
                backend = { kind = "durable", path = "/var/lib/cfgdb" }

                [audit]
                scan_batch_size = 200
            "#,
        )
        .unwrap();
        let config = ManageConfig::load(&path).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Durable { path: "/var/lib/cfgdb".into() });
        assert_eq!(config.audit.scan_batch_size, 200);
        assert_eq!(config.audit.id_pools.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ManageConfig::load(&dir.path().join("absent.toml")).is_err());
    }
}
