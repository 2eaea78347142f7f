use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::{GantryConfig, ProviderConfig};

/// Loads and optionally hot-reloads the gateway configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<GantryConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > GANTRY_CONFIG env > ./gantry.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("GANTRY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("gantry.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> gantry_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<GantryConfig>(&raw).map_err(|e| {
                gantry_core::GatewayError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            GantryConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(gantry_core::GatewayError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> GantryConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<GantryConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides. Config file values take priority for API keys;
    /// everything else in the documented list wins over the file.
    pub fn apply_env_overrides(mut config: GantryConfig) -> GantryConfig {
        if let Ok(v) = std::env::var("PORT")
            && let Ok(port) = v.parse::<u16>()
        {
            config.server.port = port;
        }
        if let Ok(v) = std::env::var("HEALTH_PORT")
            && let Ok(port) = v.parse::<u16>()
        {
            config.server.health_port = Some(port);
        }
        if let Ok(v) = std::env::var("ROUTER_POLICY") {
            config.router.policy = v;
        }
        if let Ok(v) = std::env::var("ALIASES_PATH") {
            config.aliases_path = Some(PathBuf::from(v));
        }

        // Circuit breaker
        if let Ok(v) = std::env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
            && let Ok(n) = v.parse::<u32>()
        {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Ok(v) = std::env::var("CIRCUIT_BREAKER_RECOVERY_TIMEOUT")
            && let Ok(n) = v.parse::<u64>()
        {
            config.circuit_breaker.recovery_timeout_secs = n;
        }
        if let Ok(v) = std::env::var("CIRCUIT_BREAKER_HALF_OPEN_LIMIT")
            && let Ok(n) = v.parse::<u32>()
        {
            config.circuit_breaker.half_open_limit = n;
        }

        // Retry
        if let Ok(v) = std::env::var("RETRY_MAX_ATTEMPTS")
            && let Ok(n) = v.parse::<u32>()
        {
            config.retry.max_attempts = n;
        }
        if let Ok(v) = std::env::var("RETRY_BASE_DELAY_MS")
            && let Ok(n) = v.parse::<u64>()
        {
            config.retry.base_delay_ms = n;
        }
        if let Ok(v) = std::env::var("RETRY_MAX_DELAY_MS")
            && let Ok(n) = v.parse::<u64>()
        {
            config.retry.max_delay_ms = n;
        }
        if let Ok(v) = std::env::var("RETRY_BACKOFF_FACTOR")
            && let Ok(n) = v.parse::<f64>()
        {
            config.retry.backoff_factor = n;
        }
        if let Ok(v) = std::env::var("RETRY_JITTER")
            && let Ok(b) = v.parse::<bool>()
        {
            config.retry.jitter = b;
        }
        if let Ok(v) = std::env::var("RETRY_RETRYABLE_ERRORS") {
            config.retry.retryable_errors =
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }

        // Failover
        if let Ok(v) = std::env::var("FAILOVER_STRATEGY") {
            config.failover.strategy = v;
        }
        if let Ok(v) = std::env::var("FAILOVER_MAX_ATTEMPTS")
            && let Ok(n) = v.parse::<u32>()
        {
            config.failover.max_attempts = n;
        }
        if let Ok(v) = std::env::var("FAILOVER_HEALTH_THRESHOLD")
            && let Ok(n) = v.parse::<f64>()
        {
            config.failover.health_threshold = n;
        }

        // API keys and base URLs: env fills in when the file doesn't set them.
        Self::provider_env_fallback(&mut config, "openai", "OPENAI_API_KEY", "OPENAI_BASE_URL");
        Self::provider_env_fallback(
            &mut config,
            "anthropic",
            "ANTHROPIC_API_KEY",
            "ANTHROPIC_BASE_URL",
        );

        config
    }

    fn provider_env_fallback(config: &mut GantryConfig, name: &str, key_var: &str, url_var: &str) {
        let entry = config
            .providers
            .entry(name.to_string())
            .or_insert_with(ProviderConfig::default);
        if entry.api_key.is_none()
            && let Ok(v) = std::env::var(key_var)
        {
            entry.api_key = Some(v);
        }
        if entry.base_url.is_none()
            && let Ok(v) = std::env::var(url_var)
        {
            entry.base_url = Some(v);
        }
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> gantry_core::Result<()> {
        if !self.config_path.exists() {
            return Err(gantry_core::GatewayError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<GantryConfig>(&raw).map_err(|e| {
            gantry_core::GatewayError::Config(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads when the config file
    /// changes. The returned watcher must be kept alive.
    pub fn watch(&self) -> gantry_core::Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {
                        let is_our_file = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == path_for_event.file_name());
                        if !is_our_file {
                            return;
                        }

                        info!("config file changed, reloading");
                        match std::fs::read_to_string(&path_for_event) {
                            Ok(raw) => match toml::from_str::<GantryConfig>(&raw) {
                                Ok(new_config) => {
                                    let new_config = ConfigLoader::apply_env_overrides(new_config);
                                    *config.write() = new_config;
                                    info!("configuration hot-reloaded successfully");
                                }
                                Err(e) => {
                                    warn!(error = %e, "config file has errors, keeping current config");
                                }
                            },
                            Err(e) => {
                                warn!(error = %e, "failed to read config file during hot-reload");
                            }
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            })
            .map_err(|e| {
                gantry_core::GatewayError::Config(format!("failed to create file watcher: {}", e))
            })?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                gantry_core::GatewayError::Config(format!("failed to watch config directory: {}", e))
            })?;

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().server.port, 4000);
    }

    #[test]
    fn load_and_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        std::fs::write(&path, "[server]\nport = 5100\n").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().server.port, 5100);

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[server]\nport = 5200").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().server.port, 5200);
    }

    #[test]
    fn invalid_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        std::fs::write(&path, "[router]\npolicy = \"cheapest\"\n").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }
}
