use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compiler::CompilerOptions;
use crate::error::Error;

pub const CONFIG_FILE: &str = "trellis.toml";

/// `trellis.toml`. Every key is optional:
///
/// ```toml
/// templates = "templates"
/// extension = "html"
///
/// [cache]
/// enabled = true
/// dir = ".trellis-cache"
///
/// [compiler]
/// prefix = "directive"
/// strict = true
/// interpolate_text = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Template root. Relative paths are taken from the config file's
    /// directory.
    pub templates: PathBuf,
    /// Appended to template names given without an extension.
    pub extension: Option<String>,
    pub cache: CacheConfig,
    pub compiler: CompilerOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// On-disk cache directory; without one compiled programs are only kept
    /// in memory.
    pub dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            templates: PathBuf::from("templates"),
            extension: Some("html".into()),
            cache: CacheConfig::default(),
            compiler: CompilerOptions::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let config_err = |message: String| Error::Config {
            path: path.to_path_buf(),
            message,
        };
        let text = fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let mut config = Self::from_toml(&text).map_err(|e| config_err(e.to_string()))?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    /// `dir/trellis.toml` when it exists, defaults rooted at `dir` otherwise.
    pub fn discover(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            tracing::debug!(config = %path.display(), "loading config");
            return Self::load(&path);
        }
        let mut config = Self::default();
        config.rebase(dir);
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        if self.templates.is_relative() {
            self.templates = base.join(&self.templates);
        }
        if let Some(dir) = &mut self.cache.dir {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}
