use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `BACKUP_WATCH__BACKUP_ROOT=/mnt/usb`.
pub const ENV_PREFIX: &str = "BACKUP_WATCH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Source directory trees mirrored into the backup store
    pub paths: Vec<PathBuf>,

    /// Backup drive root; files land under `<backup_root>/backup_test`
    pub backup_root: PathBuf,

    /// Insert each watched root's directory name into the mirrored layout
    pub nest_root_name: bool,

    /// Dispatcher and hashing worker count (0 = auto based on CPU)
    pub workers: usize,

    /// Capacity of the live event queue
    pub queue_capacity: usize,

    /// Capacity of the per-walk record and path queues
    pub walk_buffer: usize,

    /// Source files at or above this size (in MB) are never reconciled (0 = no limit)
    pub max_file_size_mb: u64,

    /// File extensions (without dot, case-insensitive) no walk ever visits
    pub ignored_extensions: Vec<String>,

    /// Legacy guard: skip a file when any backed-up file shares its name
    pub name_guard: bool,

    /// Base rest period between reconciliation passes
    #[serde(with = "humantime_duration")]
    pub janitor_interval: Duration,

    /// How often watched trees are re-walked for new directories
    #[serde(with = "humantime_duration")]
    pub refresh_interval: Duration,

    /// Image transcoding on ingest
    pub compress: CompressConfig,

    /// Optional JSON log file
    pub log_file: Option<PathBuf>,

    /// Debug level logging
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressConfig {
    pub enabled: bool,

    /// Target quality (1-100); images already at or below it are left alone
    pub quality: u8,

    /// Extensions treated as images
    pub image_extensions: Vec<String>,

    /// File name prefixes narrowing which images are compressed (`*` = all)
    pub prefix: Vec<String>,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quality: 80,
            image_extensions: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "pdf".to_string(),
            ],
            prefix: vec!["*".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            backup_root: PathBuf::from("/mnt/backup"),
            nest_root_name: false,
            workers: 0, // Auto-detect
            queue_capacity: 100,
            walk_buffer: 100,
            max_file_size_mb: 50,
            ignored_extensions: vec![
                "tmp".to_string(),
                "swp".to_string(),
                "swx".to_string(),
                "part".to_string(),
                "partial".to_string(),
                "crdownload".to_string(),
            ],
            name_guard: false,
            janitor_interval: Duration::from_secs(30 * 60),
            refresh_interval: Duration::from_secs(3),
            compress: CompressConfig::default(),
            log_file: None,
            debug: false,
        }
    }
}

impl Config {
    /// Load config from defaults, the given file (if any), and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .context("serializing default config")?;

        let mut builder = config::Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .context("reading configuration sources")?
            .try_deserialize()
            .context("parsing configuration")?;

        // Auto-detect workers if not set
        if config.workers == 0 {
            config.workers = num_cpus::get();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            anyhow::bail!("no watched paths configured");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.queue_capacity == 0 || self.walk_buffer == 0 {
            anyhow::bail!("queue_capacity and walk_buffer must be positive");
        }
        if !(1..=100).contains(&self.compress.quality) {
            anyhow::bail!(
                "compress.quality must be within 1..=100, got {}",
                self.compress.quality
            );
        }
        if self.refresh_interval.is_zero() {
            anyhow::bail!("refresh_interval must be positive");
        }
        Ok(())
    }

    /// Maximum source file size in bytes, `None` when unlimited
    pub fn max_file_size(&self) -> Option<u64> {
        (self.max_file_size_mb > 0).then(|| self.max_file_size_mb * 1_048_576)
    }
}

/// `<config dir>/backup-watch/config.yml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("backup-watch").join("config.yml"))
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "paths: [\"/srv/photos\", \"/srv/docs\"]\n\
             backup_root: /mnt/usb\n\
             workers: 3\n\
             janitor_interval: 10m\n\
             compress:\n  enabled: true\n  quality: 70\n  prefix: [\"IMG_\"]"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.paths.len(), 2);
        assert_eq!(config.backup_root, PathBuf::from("/mnt/usb"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.janitor_interval, Duration::from_secs(600));
        assert_eq!(config.refresh_interval, Duration::from_secs(3));
        assert!(config.compress.enabled);
        assert_eq!(config.compress.quality, 70);
        assert_eq!(config.compress.prefix, vec!["IMG_".to_string()]);
        // untouched nested defaults survive a partial section
        assert_eq!(config.compress.image_extensions.len(), 4);
    }

    #[test]
    fn test_missing_paths_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "backup_root: /mnt/usb").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_quality_out_of_range_rejected() {
        let config = Config {
            paths: vec![PathBuf::from("/srv")],
            workers: 1,
            compress: CompressConfig {
                quality: 0,
                ..CompressConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_file_size() {
        let mut config = Config::default();
        assert_eq!(config.max_file_size(), Some(50 * 1_048_576));
        config.max_file_size_mb = 0;
        assert_eq!(config.max_file_size(), None);
    }
}
