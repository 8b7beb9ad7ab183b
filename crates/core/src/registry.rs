//! In-process manifest registry.
//!
//! Manifests are loaded from a directory at startup (or registered on
//! demand) and kept in memory for the life of the process, keyed by model
//! name. Re-registering a name replaces the previous entry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::manifest::{load_manifest, ManifestError, ModelManifest};

/// Thread-safe registry of validated manifests.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    inner: RwLock<HashMap<String, Arc<ModelManifest>>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manifest; last-loaded-wins. Returns the replaced entry.
    pub fn register(&self, manifest: ModelManifest) -> Option<Arc<ModelManifest>> {
        let name = manifest.name.clone();
        let mut map = self.inner.write().expect("registry lock poisoned");
        map.insert(name, Arc::new(manifest))
    }

    /// Look up a manifest by model name.
    pub fn get(&self, name: &str) -> Option<Arc<ModelManifest>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All registered manifests, sorted by model name.
    pub fn list(&self) -> Vec<Arc<ModelManifest>> {
        let map = self.inner.read().expect("registry lock poisoned");
        let mut manifests: Vec<_> = map.values().cloned().collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every `*.yaml` / `*.yml` file in `dir` into the registry.
    ///
    /// Fails fast on the first invalid manifest so a bad deploy cannot
    /// silently serve a partial model set. Files are visited in sorted
    /// order, which makes the last-loaded-wins overwrite deterministic.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, ManifestError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let manifest = load_manifest(&path)?;
            tracing::info!(
                model = %manifest.name,
                version = manifest.version,
                kind = %manifest.kind,
                path = %path.display(),
                "registered manifest"
            );
            if self.register(manifest).is_some() {
                tracing::warn!(path = %path.display(), "manifest replaced an existing entry");
            }
            loaded += 1;
        }
        Ok(loaded)
    }
}
