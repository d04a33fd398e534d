use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::LoadError;

/// Template text plus the canonical name it is cached and reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub identity: String,
    pub source: String,
}

pub trait TemplateLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<TemplateSource, LoadError>;

    /// Every template this loader can serve, for cache warming.
    fn names(&self) -> Result<Vec<String>, LoadError> {
        Ok(Vec::new())
    }
}

/// `a/./b/../c.html` to `a/c.html`. Names may not climb above the root.
pub fn normalize(name: &str) -> Result<String, LoadError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(LoadError::OutsideRoot(name.to_string()));
                }
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(LoadError::NotFound(name.to_string()));
    }
    Ok(parts.join("/"))
}

/// Loads templates from a directory.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
    extension: Option<String>,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: None,
        }
    }

    /// Append `.ext` to names given without one, and only list files with it.
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extension = Some(ext.trim_start_matches('.').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity(&self, name: &str) -> Result<String, LoadError> {
        let mut identity = normalize(name)?;
        if let Some(ext) = &self.extension {
            let file = identity.rsplit('/').next().unwrap_or(&identity);
            if !file.contains('.') {
                identity = format!("{identity}.{ext}");
            }
        }
        Ok(identity)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), LoadError> {
        let io_err = |source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(dir)
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, out)?;
                continue;
            }
            let wanted = match &self.extension {
                Some(ext) => path.extension().is_some_and(|e| e == ext.as_str()),
                None => true,
            };
            if !wanted {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(&self.root) {
                let name: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(name.join("/"));
            }
        }
        Ok(())
    }
}

impl TemplateLoader for FsLoader {
    fn load(&self, name: &str) -> Result<TemplateSource, LoadError> {
        let identity = self.identity(name)?;
        let path = self.root.join(&identity);
        match fs::read_to_string(&path) {
            Ok(source) => Ok(TemplateSource { identity, source }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LoadError::NotFound(identity)),
            Err(source) => Err(LoadError::Io { path, source }),
        }
    }

    fn names(&self) -> Result<Vec<String>, LoadError> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out)?;
        Ok(out)
    }
}

/// Templates held in memory, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    templates: RwLock<BTreeMap<String, String>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, K, V>(templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let loader = Self::new();
        for (name, source) in templates {
            loader.insert(name.as_ref(), source);
        }
        loader
    }

    /// Add or replace a template. Names are normalized; invalid ones are
    /// stored as given and never found.
    pub fn insert(&self, name: &str, source: impl Into<String>) {
        let key = normalize(name).unwrap_or_else(|_| name.to_string());
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.insert(key, source.into());
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        let key = normalize(name).ok()?;
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.remove(&key)
    }
}

impl TemplateLoader for MemoryLoader {
    fn load(&self, name: &str) -> Result<TemplateSource, LoadError> {
        let identity = normalize(name)?;
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        match templates.get(&identity) {
            Some(source) => Ok(TemplateSource {
                identity,
                source: source.clone(),
            }),
            None => Err(LoadError::NotFound(identity)),
        }
    }

    fn names(&self) -> Result<Vec<String>, LoadError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        Ok(templates.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize("./a//b/../c.html").unwrap(), "a/c.html");
        assert!(matches!(normalize("../etc/passwd"), Err(LoadError::OutsideRoot(_))));
    }

    #[test]
    fn fs_loader_reads_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("partials")).unwrap();
        fs::write(dir.path().join("page.html"), "<p>page</p>").unwrap();
        fs::write(dir.path().join("partials/card.html"), "<div></div>").unwrap();
        fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let loader = FsLoader::new(dir.path()).with_extension("html");
        let page = loader.load("page").unwrap();
        assert_eq!(page.identity, "page.html");
        assert_eq!(page.source, "<p>page</p>");
        assert_eq!(loader.names().unwrap(), ["page.html", "partials/card.html"]);
        assert!(matches!(loader.load("missing.html"), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn memory_loader_replaces_templates() {
        let loader = MemoryLoader::with([("a.html", "one")]);
        loader.insert("./a.html", "two");
        assert_eq!(loader.load("a.html").unwrap().source, "two");
        loader.remove("a.html");
        assert!(loader.load("a.html").is_err());
    }
}
