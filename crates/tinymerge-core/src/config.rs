use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub merge: MergeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    /// Upper bound on filesystem operations in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Where backup directories are created. System temp dir when unset.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            backup_dir: None,
            timeout_secs: None,
        }
    }
}

impl MergeSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn backup_parent(&self) -> PathBuf {
        self.backup_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: None,
            filter: default_filter(),
        }
    }
}

fn default_max_concurrency() -> usize {
    64
}
fn default_filter() -> String {
    "info".into()
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings from `path`, or the defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.merge.max_concurrency == 0 {
            anyhow::bail!("merge.max_concurrency must be at least 1");
        }
        if self.merge.timeout_secs == Some(0) {
            anyhow::bail!("merge.timeout_secs must be positive when set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_sections_use_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.merge.max_concurrency, 64);
        assert_eq!(settings.merge.backup_dir, None);
        assert_eq!(settings.merge.timeout(), None);
        assert_eq!(settings.logging.filter, "info");

        let settings: Settings =
            serde_json::from_str(r#"{"merge": {"timeout_secs": 30}}"#).unwrap();
        assert_eq!(settings.merge.max_concurrency, 64);
        assert_eq!(settings.merge.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/settings.json");
        let mut settings = Settings::default();
        settings.merge.max_concurrency = 8;
        settings.merge.backup_dir = Some(tmp.path().join("bak"));

        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();

        assert_eq!(loaded.merge.max_concurrency, 8);
        assert_eq!(loaded.merge.backup_parent(), tmp.path().join("bak"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"merge": {"max_concurrency": 0}}"#).unwrap();

        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load_or_default(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(settings.merge.max_concurrency, 64);
    }
}
