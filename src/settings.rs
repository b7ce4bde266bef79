use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::render::{
    DEFAULT_BATCH_SIZE, DEFAULT_INITIAL_BATCH, DEFAULT_MEMORY_DIVISOR, DEFAULT_PREFETCH_MARGIN,
    DEFAULT_TARGET_WIDTH, PrefetchPolicy, SchedulerConfig,
};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
pub const APP_NAME: &str = "pagevisor";
/// Budget used when physical memory cannot be determined
const FALLBACK_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_initial_batch")]
    pub initial_batch: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_prefetch_margin")]
    pub prefetch_margin: usize,

    #[serde(default = "default_target_width")]
    pub target_width: u32,

    /// Memory cache gets 1/n of physical memory
    #[serde(default = "default_memory_divisor")]
    pub memory_fraction_divisor: u64,

    /// Explicit memory cache budget, overriding the divisor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_budget_bytes: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_initial_batch() -> usize {
    DEFAULT_INITIAL_BATCH
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_prefetch_margin() -> usize {
    DEFAULT_PREFETCH_MARGIN
}

fn default_target_width() -> u32 {
    DEFAULT_TARGET_WIDTH
}

fn default_memory_divisor() -> u64 {
    DEFAULT_MEMORY_DIVISOR
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            initial_batch: default_initial_batch(),
            batch_size: default_batch_size(),
            prefetch_margin: default_prefetch_margin(),
            target_width: default_target_width(),
            memory_fraction_divisor: default_memory_divisor(),
            memory_budget_bytes: None,
            cache_root: None,
            log_level: default_log_level(),
        }
    }
}

impl RenderSettings {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {path:?}"))?;
        let mut settings: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {path:?}"))?;
        debug!("Loaded settings from {path:?}");

        if settings.version < CURRENT_VERSION {
            migrate_settings(&mut settings);
            settings.save_to_path(path)?;
        }
        settings.sanitize();
        Ok(settings)
    }

    /// Load from the user's config directory, writing defaults there if no
    /// file exists yet. Falls back to defaults on any error.
    #[must_use]
    pub fn load_or_default() -> Self {
        let Some(path) = preferred_config_path() else {
            warn!("Could not determine config directory, using default settings");
            return Self::default();
        };
        if path.exists() {
            return Self::load_from_path(&path).unwrap_or_else(|e| {
                warn!("{e:#}; using default settings");
                Self::default()
            });
        }

        info!("Settings file not found, creating with defaults at {path:?}");
        let settings = Self::default();
        if let Err(e) = settings.save_to_path(&path) {
            warn!("{e:#}");
        }
        settings
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {parent:?}"))?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize settings")?;
        fs::write(path, yaml).with_context(|| format!("Failed to write settings file {path:?}"))?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }

    /// Clamp values that would stall rendering.
    fn sanitize(&mut self) {
        if self.batch_size == 0 {
            warn!("batch_size must be positive, using {DEFAULT_BATCH_SIZE}");
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.target_width == 0 {
            warn!("target_width must be positive, using {DEFAULT_TARGET_WIDTH}");
            self.target_width = DEFAULT_TARGET_WIDTH;
        }
        if self.memory_fraction_divisor == 0 {
            self.memory_fraction_divisor = DEFAULT_MEMORY_DIVISOR;
        }
    }

    #[must_use]
    pub fn resolved_cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_NAME)
        })
    }

    /// Memory cache budget in bytes.
    #[must_use]
    pub fn memory_budget(&self) -> usize {
        if let Some(bytes) = self.memory_budget_bytes {
            return bytes;
        }
        match physical_memory() {
            Some(total) => {
                let budget = total / self.memory_fraction_divisor.max(1);
                usize::try_from(budget).unwrap_or(usize::MAX)
            }
            None => FALLBACK_MEMORY_BUDGET,
        }
    }

    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            initial_batch: self.initial_batch,
            batch_size: self.batch_size.max(1),
            target_width: self.target_width.max(1),
        }
    }

    #[must_use]
    pub fn prefetch_policy(&self) -> PrefetchPolicy {
        PrefetchPolicy::new(self.prefetch_margin)
    }
}

fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

fn migrate_settings(settings: &mut RenderSettings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}

#[cfg(unix)]
fn physical_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions and only reads system configuration
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

#[cfg(not(unix))]
fn physical_memory() -> Option<u64> {
    None
}
