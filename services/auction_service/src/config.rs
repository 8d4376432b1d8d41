//! Configuration for the auction service.
//!
//! Runtime behaviour is tuned through a layered, multi-source system
//! backed by the `config` crate. Priority (lowest → highest):
//!
//! 1. Compile-time defaults (`impl Default`).
//! 2. An optional `carousel.{toml,yaml,json}` file in the working
//!    directory (or an explicit path passed to [`init`]).
//! 3. Environment variables with the `CAROUSEL` prefix:
//!
//! ```text
//! CAROUSEL__ENGINE__SNIPING_THRESHOLD_SECS=15
//! ```
//!
//! The frozen [`Settings`] instance is published as a global singleton
//! through [`get`]. Tests bypass the singleton and hand `Settings::default()`
//! (or a tweaked copy) straight to the engines.

use std::path::Path;
use std::sync::Arc;

use config::{Config, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

static SETTINGS: OnceCell<Arc<Settings>> = OnceCell::new();

pub type SettingsHandle = Arc<Settings>;

/// Bid-placement and settlement tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Anti-sniping trigger: a round-1 bid landing within this many
    /// seconds of the end time extends the round.
    pub sniping_threshold_secs: i64,
    /// Seconds added to the round end time when anti-sniping triggers.
    pub sniping_extension_secs: i64,
    /// Users refunded per batch during the auction-end pass.
    pub refund_batch_size: usize,
    /// Pause between refund batches, bounding load on the store.
    pub refund_batch_pause_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sniping_threshold_secs: 10,
            sniping_extension_secs: 30,
            refund_batch_size: 50,
            refund_batch_pause_ms: 100,
        }
    }
}

/// Scheduler cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
        }
    }
}

/// Read-path cache TTLs. Write paths never consult these caches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// "Current auction" / "current round" lookups.
    pub current_ttl_ms: u64,
    /// Leaderboard reads.
    pub leaderboard_ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            current_ttl_ms: 5_000,
            leaderboard_ttl_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
}

/// Initialise the configuration singleton.
///
/// `config_path` is an optional explicit path to a configuration file; when
/// `None`, `carousel.{toml,yaml,json}` in the working directory is tried.
/// Calling `init` twice is an error.
pub fn init(config_path: Option<impl AsRef<Path>>) -> Result<SettingsHandle, ConfigError> {
    let mut builder =
        Config::builder().add_source(Config::try_from(&Settings::default())?);

    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path.as_ref()).required(true));
    } else {
        for ext in ["toml", "yaml", "json"] {
            let file_name = format!("carousel.{ext}");
            if Path::new(&file_name).exists() {
                builder = builder.add_source(File::with_name(&file_name).required(false));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("CAROUSEL")
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;

    let arc = Arc::new(settings);
    SETTINGS
        .set(arc.clone())
        .map_err(|_| ConfigError::Message("configuration already initialised".into()))?;
    Ok(arc)
}

/// Immutable access to the frozen [`Settings`]. Panics if [`init`] has not
/// been called.
#[inline]
pub fn get() -> &'static Settings {
    SETTINGS
        .get()
        .expect("configuration accessed before initialisation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_constants() {
        let settings = Settings::default();
        assert_eq!(settings.engine.sniping_threshold_secs, 10);
        assert_eq!(settings.engine.sniping_extension_secs, 30);
        assert_eq!(settings.cache.current_ttl_ms, 5_000);
        assert_eq!(settings.cache.leaderboard_ttl_ms, 2_000);
    }

    #[test]
    fn init_freezes_the_singleton() {
        let handle = init(None::<&Path>).expect("layered load with defaults");
        assert_eq!(handle.scheduler.tick_interval_secs, get().scheduler.tick_interval_secs);
        // a second initialisation is a bug in the embedding binary
        assert!(init(None::<&Path>).is_err());
    }

    #[test]
    fn settings_roundtrip_serde() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.engine.refund_batch_size, settings.engine.refund_batch_size);
    }
}
