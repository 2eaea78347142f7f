use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// The alias file format:
///
/// ```toml
/// [aliases]
/// fast = "groq:llama3-8b-8192"
///
/// [aliases.smart]
/// provider = "anthropic"
/// model = "claude-sonnet-4-20250514"
/// ```
#[derive(Debug, Deserialize)]
struct AliasDocument {
    #[serde(default)]
    aliases: HashMap<String, AliasEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AliasEntry {
    Spec(String),
    Parts { provider: String, model: String },
}

impl AliasEntry {
    fn into_spec(self) -> String {
        match self {
            Self::Spec(s) => s,
            Self::Parts { provider, model } => format!("{provider}:{model}"),
        }
    }
}

/// Maps friendly alias names to `provider:model` specs, hot-reloaded on
/// file change. Lookups always observe a complete snapshot: reload builds
/// the full candidate map first and swaps it under the write lock in a
/// single assignment.
pub struct AliasStore {
    map: Arc<RwLock<HashMap<String, String>>>,
    path: Option<PathBuf>,
    /// Whether a file has ever been parsed successfully. Defaults are only
    /// installed while this is false.
    loaded: Arc<RwLock<bool>>,
}

impl AliasStore {
    /// Aliases installed when no file was ever loaded.
    fn default_aliases() -> HashMap<String, String> {
        HashMap::from([
            ("fast".to_string(), "openai:gpt-4o-mini".to_string()),
            ("smart".to_string(), "anthropic:claude-sonnet-4-20250514".to_string()),
        ])
    }

    /// Create a store with no backing file (defaults only).
    pub fn empty() -> Self {
        Self {
            map: Arc::new(RwLock::new(Self::default_aliases())),
            path: None,
            loaded: Arc::new(RwLock::new(false)),
        }
    }

    /// Create a store backed by the given file, loading it immediately.
    /// A missing or unparsable file leaves the defaults in place.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: Some(path.into()),
            ..Self::empty()
        };
        store.reload();
        store
    }

    /// Resolve an alias to its `provider:model` spec.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.map.read().get(name).cloned()
    }

    /// Snapshot of all aliases.
    pub fn list(&self) -> HashMap<String, String> {
        self.map.read().clone()
    }

    /// Re-read the alias file. On parse failure the current snapshot is kept.
    pub fn reload(&self) {
        let Some(ref path) = self.path else { return };
        match Self::parse_file(path) {
            Ok(candidate) => {
                info!(count = candidate.len(), ?path, "aliases loaded");
                *self.map.write() = candidate;
                *self.loaded.write() = true;
            }
            Err(e) => {
                if *self.loaded.read() {
                    warn!(error = %e, ?path, "alias reload failed, keeping current aliases");
                } else {
                    warn!(error = %e, ?path, "alias load failed, keeping defaults");
                }
            }
        }
    }

    fn parse_file(path: &Path) -> gantry_core::Result<HashMap<String, String>> {
        let raw = std::fs::read_to_string(path)?;
        let doc: AliasDocument = toml::from_str(&raw)
            .map_err(|e| gantry_core::GatewayError::Config(format!("alias file: {e}")))?;
        Ok(doc
            .aliases
            .into_iter()
            .map(|(name, entry)| (name, entry.into_spec()))
            .collect())
    }

    /// Watch the alias file for changes. The returned watcher must be kept
    /// alive for reloads to continue firing.
    pub fn watch(&self) -> gantry_core::Result<notify::RecommendedWatcher> {
        let Some(ref path) = self.path else {
            return Err(gantry_core::GatewayError::Config(
                "alias store has no backing file to watch".into(),
            ));
        };
        let map = Arc::clone(&self.map);
        let loaded = Arc::clone(&self.loaded);
        let path_for_event = path.clone();

        info!(?path, "starting alias file watcher");

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
                        match Self::parse_file(&path_for_event) {
                            Ok(candidate) => {
                                info!(count = candidate.len(), "aliases hot-reloaded");
                                *map.write() = candidate;
                                *loaded.write() = true;
                            }
                            Err(e) => {
                                warn!(error = %e, "alias hot-reload failed, keeping current aliases");
                            }
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    warn!(error = %e, "alias watcher error");
                }
            })
            .map_err(|e| {
                gantry_core::GatewayError::Config(format!("failed to create alias watcher: {e}"))
            })?;

        let watch_path = path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                gantry_core::GatewayError::Config(format!("failed to watch alias directory: {e}"))
            })?;

        Ok(watcher)
    }
}

/// Split a `provider:model` spec into its parts.
pub fn split_spec(spec: &str) -> Option<(&str, &str)> {
    spec.split_once(':').filter(|(p, m)| !p.is_empty() && !m.is_empty())
}
