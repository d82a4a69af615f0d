use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pdfpager";

/// Budget used when physical memory cannot be determined
pub const FALLBACK_CACHE_BUDGET: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Fixed page cache budget in bytes, overriding the memory fraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_budget_bytes: Option<usize>,

    #[serde(default = "default_cache_memory_fraction")]
    pub cache_memory_fraction: f64,

    #[serde(default = "default_render_workers")]
    pub render_workers: usize,

    /// MuPDF handles opened per document
    #[serde(default = "default_document_workers")]
    pub document_workers: usize,

    #[serde(default = "default_prefetch_radius")]
    pub prefetch_radius: usize,

    #[serde(default = "default_max_zoom")]
    pub max_zoom: f32,

    #[serde(default = "default_link_cache_capacity")]
    pub link_cache_capacity: usize,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_cache_memory_fraction() -> f64 {
    0.25
}

fn default_render_workers() -> usize {
    2
}

fn default_document_workers() -> usize {
    2
}

fn default_prefetch_radius() -> usize {
    1
}

fn default_max_zoom() -> f32 {
    crate::pdf::DEFAULT_MAX_ZOOM
}

fn default_link_cache_capacity() -> usize {
    32
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cache_budget_bytes: None,
            cache_memory_fraction: default_cache_memory_fraction(),
            render_workers: default_render_workers(),
            document_workers: default_document_workers(),
            prefetch_radius: default_prefetch_radius(),
            max_zoom: default_max_zoom(),
            link_cache_capacity: default_link_cache_capacity(),
        }
    }
}

impl Settings {
    /// Page cache budget given the machine's physical memory
    #[must_use]
    pub fn cache_budget(&self, physical_memory: Option<u64>) -> usize {
        if let Some(bytes) = self.cache_budget_bytes {
            return bytes.max(1);
        }

        let fraction = if self.cache_memory_fraction.is_finite()
            && self.cache_memory_fraction > 0.0
            && self.cache_memory_fraction <= 1.0
        {
            self.cache_memory_fraction
        } else {
            default_cache_memory_fraction()
        };

        match physical_memory {
            Some(total) if total > 0 => {
                let budget = (total as f64 * fraction) as u64;
                usize::try_from(budget).unwrap_or(usize::MAX).max(1)
            }
            _ => FALLBACK_CACHE_BUDGET,
        }
    }
}

/// Total physical memory of this machine
#[cfg(unix)]
#[must_use]
pub fn physical_memory_bytes() -> Option<u64> {
    // SAFETY: sysconf only reads system configuration
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    u64::try_from(pages)
        .ok()?
        .checked_mul(u64::try_from(page_size).ok()?)
}

#[cfg(not(unix))]
#[must_use]
pub fn physical_memory_bytes() -> Option<u64> {
    None
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

/// Config file chosen on the command line, if any
static CONFIG_PATH: LazyLock<RwLock<Option<PathBuf>>> = LazyLock::new(|| RwLock::new(None));

fn preferred_config_path() -> Option<PathBuf> {
    if let Ok(path) = CONFIG_PATH.read() {
        if let Some(path) = path.as_ref() {
            return Some(path.clone());
        }
    }
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Use `path` instead of the platform config directory
pub fn set_config_path(path: impl Into<PathBuf>) {
    if let Ok(mut config) = CONFIG_PATH.write() {
        *config = Some(path.into());
    }
}

pub fn config_path() -> Option<PathBuf> {
    preferred_config_path()
}

pub fn load_settings() {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return;
    };

    if path.exists() {
        load_settings_from_path(&path);
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        if let Ok(settings) = SETTINGS.read() {
            save_settings_to_file(&settings, &path);
        }
    }
}

pub fn load_settings_from_path(path: &Path) {
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");

                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    save_settings_to_file(&settings, path);
                }

                if let Ok(mut global) = SETTINGS.write() {
                    *global = settings;
                }
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    settings.version = CURRENT_VERSION;
}

pub fn save_settings() {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, cannot save settings");
        return;
    };

    if let Ok(settings) = SETTINGS.read() {
        save_settings_to_file(&settings, &path);
    }
}

fn save_settings_to_file(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let content = generate_settings_yaml(settings);

    match fs::write(path, content) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(SETTINGS_HEADER);
    content.push_str(&format!("version: {}\n", settings.version));
    content.push('\n');

    content.push_str("# Page cache budget. A fixed byte count wins over the memory fraction.\n");
    match settings.cache_budget_bytes {
        Some(bytes) => content.push_str(&format!("cache_budget_bytes: {bytes}\n")),
        None => content.push_str("# cache_budget_bytes: 268435456\n"),
    }
    content.push_str(&format!(
        "cache_memory_fraction: {:?}\n",
        settings.cache_memory_fraction
    ));
    content.push('\n');

    content.push_str("# Threads rendering pages, and MuPDF handles per open document\n");
    content.push_str(&format!("render_workers: {}\n", settings.render_workers));
    content.push_str(&format!("document_workers: {}\n", settings.document_workers));
    content.push('\n');

    content.push_str("# Pages rendered ahead and behind the current one\n");
    content.push_str(&format!("prefetch_radius: {}\n", settings.prefetch_radius));
    content.push_str(&format!("max_zoom: {:?}\n", settings.max_zoom));
    content.push_str(&format!(
        "link_cache_capacity: {}\n",
        settings.link_cache_capacity
    ));

    content
}

const SETTINGS_HEADER: &str = r#"# ============================================================================
# pdfpager settings
# ============================================================================
# Unknown keys are ignored; missing keys take their defaults.

"#;

// Public API for accessing/modifying settings

#[must_use]
pub fn get_settings() -> Settings {
    SETTINGS.read().map(|s| s.clone()).unwrap_or_default()
}

pub fn set_settings(settings: Settings) {
    if let Ok(mut global) = SETTINGS.write() {
        *global = settings;
    }
    save_settings();
}

/// Page cache budget for this machine
#[must_use]
pub fn get_cache_budget_bytes() -> usize {
    let physical = physical_memory_bytes();
    SETTINGS
        .read()
        .map(|s| s.cache_budget(physical))
        .unwrap_or(FALLBACK_CACHE_BUDGET)
}

pub fn set_cache_budget_bytes(bytes: Option<usize>) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.cache_budget_bytes = bytes;
    }
    save_settings();
}

#[must_use]
pub fn get_render_workers() -> usize {
    SETTINGS
        .read()
        .map(|s| s.render_workers.max(1))
        .unwrap_or_else(|_| default_render_workers())
}

#[must_use]
pub fn get_document_workers() -> usize {
    SETTINGS
        .read()
        .map(|s| s.document_workers.max(1))
        .unwrap_or_else(|_| default_document_workers())
}

#[must_use]
pub fn get_prefetch_radius() -> usize {
    SETTINGS
        .read()
        .map(|s| s.prefetch_radius)
        .unwrap_or_else(|_| default_prefetch_radius())
}

pub fn set_prefetch_radius(radius: usize) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.prefetch_radius = radius;
    }
    save_settings();
}

#[must_use]
pub fn get_max_zoom() -> f32 {
    SETTINGS
        .read()
        .map(|s| s.max_zoom)
        .unwrap_or_else(|_| default_max_zoom())
}

pub fn set_max_zoom(zoom: f32) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.max_zoom = zoom;
    }
    save_settings();
}

#[must_use]
pub fn get_link_cache_capacity() -> usize {
    SETTINGS
        .read()
        .map(|s| s.link_cache_capacity)
        .unwrap_or_else(|_| default_link_cache_capacity())
}
