//! Turning files in the script directory into loaded scripts

mod rules;
mod vocabulary;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::context::ScriptContext;
use crate::error::LoadError;
use crate::script::Script;

pub use rules::{ParsedRuleFile, TomlScriptLoader};
pub use vocabulary::Vocabulary;

/// One script source file, read into memory
#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// File stem, used as the script id
    pub id: String,
    pub path: PathBuf,
    pub contents: String,
}

impl ScriptSource {
    pub fn read(path: &Path) -> Result<Self, LoadError> {
        let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            id: script_id(path),
            path: path.to_path_buf(),
            contents,
        })
    }
}

/// Executes script sources of one format
pub trait ScriptLoader: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether this loader handles `path`
    fn accepts(&self, path: &Path) -> bool;

    /// Execute `source` against `ctx`. A returned instance is kept alive until
    /// the generation is unloaded.
    fn load(
        &self,
        source: &ScriptSource,
        ctx: &mut ScriptContext,
    ) -> Result<Option<Box<dyn Script>>, LoadError>;
}

/// Script id for a path: its file stem
pub fn script_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Hidden files and editor backups never count as scripts
pub fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return true;
    };
    name.starts_with('.') || name.ends_with('~')
}

/// Whether per-script configuration leaves `id` enabled (default: yes)
pub fn is_enabled(id: &str, script_config: &HashMap<String, toml::Value>) -> bool {
    script_config
        .get(id)
        .and_then(|config| config.get("enabled"))
        .and_then(|enabled| enabled.as_bool())
        .unwrap_or(true)
}

/// Script files in `dir` that some loader accepts, sorted by path
pub fn discover_sources(
    dir: &Path,
    loaders: &[std::sync::Arc<dyn ScriptLoader>],
    script_config: &HashMap<String, toml::Value>,
) -> Vec<PathBuf> {
    if !dir.exists() {
        info!(
            target: "scripting",
            "Script directory does not exist: {} (this is fine if no scripts are being used)",
            dir.display()
        );
        return Vec::new();
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                target: "scripting",
                "Failed to read script directory {}: {}",
                dir.display(),
                e
            );
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && !is_ignored(path))
        .filter(|path| loaders.iter().any(|loader| loader.accepts(path)))
        .filter(|path| {
            let id = script_id(path);
            let enabled = is_enabled(&id, script_config);
            if !enabled {
                debug!(target: "scripting", "Script '{}' is disabled in config", id);
            }
            enabled
        })
        .collect();
    paths.sort();
    paths
}
