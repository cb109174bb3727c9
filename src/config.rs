//! Configuration for the CLI: lease timing, chunking, and paths.
//!
//! The library never reads this; brokers take explicit `LeaseOptions`.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
   error::{ConfigError, Result},
   lease::LeaseOptions,
   types::{DEFAULT_CHUNK_SIZE, DEFAULT_NAMESPACE, Namespace},
};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const MAX_CHUNK_SIZE_CAP: usize = 16 * 1024 * 1024;
const MIN_POLLING_INTERVAL_MS: u64 = 10;

/// Application configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub namespace: String,

   pub lease_expiration_ms: u64,
   pub polling_interval_ms: u64,
   /// Warning threshold before expiry; 0 uses the polling interval.
   pub expires_soon_ms:     u64,
   /// How long to wait on a busy resource; 0 fails fast.
   pub acquire_timeout_ms:  u64,

   pub chunk_size:     usize,
   pub max_chunk_size: usize,

   /// Overrides `~/.gridlock/data`.
   #[serde(skip_serializing_if = "Option::is_none")]
   pub data_dir: Option<PathBuf>,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         namespace:           DEFAULT_NAMESPACE.to_string(),
         lease_expiration_ms: 300_000,
         polling_interval_ms: 5_000,
         expires_soon_ms:     0,
         acquire_timeout_ms:  0,
         chunk_size:          DEFAULT_CHUNK_SIZE,
         max_chunk_size:      MAX_CHUNK_SIZE_CAP,
         data_dir:            None,
      }
   }
}

impl Config {
   pub fn load() -> Self {
      let config_path = ensure_global_config();
      Self::extract(
         Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("GRIDLOCK_").lowercase(true)),
      )
   }

   fn extract(figment: Figment) -> Self {
      figment
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   fn create_default_config(path: &Path) {
      if let Some(parent) = path.parent() {
         let _ = fs::create_dir_all(parent);
      }
      let default_config = Self::default();
      if let Ok(toml) = toml::to_string_pretty(&default_config) {
         let _ = fs::write(path, toml);
      }
   }

   pub fn validate(&self) -> Result<()> {
      if self.lease_expiration_ms == 0 {
         return Err(ConfigError::Invalid("lease_expiration_ms must be positive".to_string()).into());
      }
      if self.polling_interval_ms < MIN_POLLING_INTERVAL_MS {
         return Err(
            ConfigError::Invalid(format!(
               "polling_interval_ms {} is below the minimum {MIN_POLLING_INTERVAL_MS}",
               self.polling_interval_ms
            ))
            .into(),
         );
      }
      if self.chunk_size == 0 || self.chunk_size > self.effective_max_chunk_size() {
         return Err(
            ConfigError::Invalid(format!(
               "chunk_size {} must be between 1 and {}",
               self.chunk_size,
               self.effective_max_chunk_size()
            ))
            .into(),
         );
      }
      self.namespace()?;
      Ok(())
   }

   pub fn namespace(&self) -> Result<Namespace> {
      Namespace::new(self.namespace.clone())
   }

   pub fn effective_max_chunk_size(&self) -> usize {
      self.max_chunk_size.min(MAX_CHUNK_SIZE_CAP).max(1)
   }

   pub fn lease_options(&self) -> LeaseOptions {
      let mut options = LeaseOptions::default()
         .with_expiration(Duration::from_millis(self.lease_expiration_ms))
         .with_polling_interval(Duration::from_millis(self.polling_interval_ms))
         .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms));
      if self.expires_soon_ms > 0 {
         options = options.with_expires_soon(Duration::from_millis(self.expires_soon_ms));
      }
      options
   }

   pub fn resolved_data_dir(&self) -> PathBuf {
      self.data_dir.clone().unwrap_or_else(|| data_dir().clone())
   }
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Returns the base directory for gridlock data and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".gridlock"))
}

fn ensure_global_config() -> PathBuf {
   let config_path = config_file_path();
   if !config_path.exists() {
      Config::create_default_config(config_path);
   }
   config_path.clone()
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
   data_dir: "data",
}
