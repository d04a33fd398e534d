use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use trellis_runtime::{Fragment, FragmentHost, HelperRegistry, Program, RenderError, Runtime};

use crate::assembler;
use crate::cache::{CacheEntry, CacheStore, FsCacheStore, MemoryCacheStore, fingerprint};
use crate::compiler::{Compiled, Compiler, CompilerOptions};
use crate::config::EngineConfig;
use crate::error::{CacheError, CompileError, Error, LoadError};
use crate::loader::{FsLoader, TemplateLoader};

/// Outcome of [`Engine::warm`].
#[derive(Debug, Default)]
pub struct WarmReport {
    pub compiled: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

type FragmentKey = (String, String);

/// Loads, compiles (through the cache) and renders templates.
pub struct Engine {
    compiler: Compiler,
    runtime: Runtime,
    loader: Arc<dyn TemplateLoader>,
    cache: Option<Arc<dyn CacheStore>>,
    // fragments compiled for render-time embeds, by template fingerprint
    fragments: RwLock<HashMap<FragmentKey, (String, Arc<Fragment>)>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("compiler", &self.compiler)
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Standard helpers, default options and an in-memory cache.
    pub fn new(loader: Arc<dyn TemplateLoader>) -> Self {
        let helpers = HelperRegistry::standard();
        Self {
            compiler: Compiler::new(CompilerOptions::default(), &helpers),
            runtime: Runtime::new(helpers),
            loader,
            cache: Some(Arc::new(MemoryCacheStore::new())),
            fragments: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut loader = FsLoader::new(&config.templates);
        if let Some(ext) = &config.extension {
            loader = loader.with_extension(ext);
        }
        let cache: Option<Arc<dyn CacheStore>> = match (config.cache.enabled, &config.cache.dir) {
            (false, _) => None,
            (true, Some(dir)) => Some(Arc::new(FsCacheStore::new(dir))),
            (true, None) => Some(Arc::new(MemoryCacheStore::new())),
        };
        Self::new(Arc::new(loader))
            .with_options(config.compiler.clone())
            .with_cache(cache)
    }

    /// Replace the helper registry. Templates may call exactly its
    /// namespaced helpers.
    pub fn with_helpers(mut self, helpers: HelperRegistry) -> Self {
        self.compiler = Compiler::new(self.compiler.options().clone(), &helpers);
        self.runtime = Runtime::new(helpers);
        self
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.compiler = Compiler::new(options, self.runtime.helpers());
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn CacheStore>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn compiler_mut(&mut self) -> &mut Compiler {
        &mut self.compiler
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn loader(&self) -> &dyn TemplateLoader {
        self.loader.as_ref()
    }

    /// Compile `source` without touching the cache.
    pub fn compile(&self, identity: &str, source: &str) -> Result<Compiled, Error> {
        Ok(self.compiler.compile(identity, source, self.loader.as_ref())?)
    }

    /// Program text for the template `name`, from the cache when fresh.
    pub fn compile_template(&self, name: &str) -> Result<String, Error> {
        let template = self.loader.load(name)?;
        Ok(self.cached(&template.identity, &template.source)?)
    }

    /// Several templates linked into one program, rendered back to back.
    pub fn compile_bundle(&self, names: &[&str]) -> Result<String, Error> {
        let programs = names
            .iter()
            .map(|name| self.compile_template(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assembler::link(&programs))
    }

    pub fn render(&self, name: &str, data: &Value) -> Result<String, Error> {
        tracing::debug!(template = name, "render");
        let code = self.compile_template(name)?;
        self.run(&code, data)
    }

    /// Render source that did not come from the loader. It is cached under
    /// `identity` like any other template.
    pub fn render_source(&self, identity: &str, source: &str, data: &Value) -> Result<String, Error> {
        let code = self.cached(identity, source)?;
        self.run(&code, data)
    }

    pub fn render_bundle(&self, names: &[&str], data: &Value) -> Result<String, Error> {
        let code = self.compile_bundle(names)?;
        self.run(&code, data)
    }

    /// Render already compiled program text.
    pub fn run(&self, code: &str, data: &Value) -> Result<String, Error> {
        let program = self.runtime.load(code)?;
        Ok(self.runtime.execute(&program, data, self)?)
    }

    /// Drop the cached program of `name`.
    pub fn invalidate(&self, name: &str) -> Result<(), CacheError> {
        let identity = self
            .loader
            .load(name)
            .map(|t| t.identity)
            .unwrap_or_else(|_| name.to_string());
        self.write_fragments().retain(|(template, _), _| *template != identity);
        match &self.cache {
            Some(cache) => cache.remove(&identity),
            None => Ok(()),
        }
    }

    pub fn clear_cache(&self) -> Result<(), CacheError> {
        self.write_fragments().clear();
        match &self.cache {
            Some(cache) => cache.clear(),
            None => Ok(()),
        }
    }

    /// Compile every template the loader lists, filling the cache.
    pub fn warm(&self) -> Result<WarmReport, Error> {
        let mut report = WarmReport::default();
        for name in self.loader.names()? {
            match self.compile_template(&name) {
                Ok(_) => report.compiled.push(name),
                Err(e) => {
                    tracing::warn!(template = %name, error = %e, "warm: compile failed");
                    report.failed.push((name, e));
                }
            }
        }
        tracing::info!(
            compiled = report.compiled.len(),
            failed = report.failed.len(),
            "cache warmed"
        );
        Ok(report)
    }

    fn write_fragments(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<FragmentKey, (String, Arc<Fragment>)>> {
        self.fragments.write().unwrap_or_else(|e| e.into_inner())
    }

    // Whether every template an entry was compiled from still has the
    // fingerprint it had then.
    fn fresh(&self, entry: &CacheEntry) -> bool {
        entry.dependencies.iter().all(|(dep, fp)| {
            if *dep == entry.identity {
                return *fp == entry.fingerprint;
            }
            match self.loader.load(dep) {
                Ok(t) => fingerprint(&t.source) == *fp,
                Err(_) => false,
            }
        })
    }

    fn lookup(&self, identity: &str, fp: &str) -> Option<CacheEntry> {
        let cache = self.cache.as_ref()?;
        match cache.get(identity, fp) {
            Ok(Some(entry)) if self.fresh(&entry) => {
                tracing::debug!(template = identity, "cache hit");
                Some(entry)
            }
            Ok(Some(_)) => {
                tracing::debug!(template = identity, "cache entry stale: a dependency changed");
                None
            }
            Ok(None) => {
                tracing::debug!(template = identity, "cache miss");
                None
            }
            Err(e) => {
                tracing::warn!(template = identity, error = %e, "cache read failed; compiling");
                None
            }
        }
    }

    fn store(&self, entry: &CacheEntry) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(entry) {
                tracing::warn!(template = %entry.identity, error = %e, "cache write failed");
            }
        }
    }

    fn cached(&self, identity: &str, source: &str) -> Result<String, CompileError> {
        let fp = fingerprint(source);
        if let Some(entry) = self.lookup(identity, &fp) {
            return Ok(entry.code);
        }
        let compiled = self.compiler.compile(identity, source, self.loader.as_ref())?;
        self.store(&CacheEntry::new(identity, &fp, compiled.dependencies, compiled.code.clone()));
        Ok(compiled.code)
    }

    fn compile_fragment(&self, template: &str, fragment: &str) -> Result<Option<Arc<Fragment>>, Error> {
        let loaded = match self.loader.load(template) {
            Ok(loaded) => loaded,
            Err(LoadError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let fp = fingerprint(&loaded.source);
        let key = (loaded.identity.clone(), fragment.to_string());
        {
            let memo = self.fragments.read().unwrap_or_else(|e| e.into_inner());
            if let Some((memo_fp, found)) = memo.get(&key) {
                if *memo_fp == fp {
                    return Ok(Some(found.clone()));
                }
            }
        }

        let cache_identity = format!("{}::{fragment}", loaded.identity);
        let (params, code) = match self.lookup(&cache_identity, &fp) {
            Some(entry) => (entry.params, entry.code),
            None => {
                let Some(compiled) = self
                    .compiler
                    .compile_fragment(&loaded.identity, fragment, self.loader.as_ref())?
                else {
                    return Ok(None);
                };
                let mut entry = CacheEntry::new(
                    &cache_identity,
                    &fp,
                    compiled.compiled.dependencies,
                    compiled.compiled.code,
                );
                entry.params = compiled.params;
                self.store(&entry);
                (entry.params, entry.code)
            }
        };

        let program: Program = self.runtime.load(&code)?;
        let found = Arc::new(Fragment { params, program });
        self.write_fragments().insert(key, (fp, found.clone()));
        Ok(Some(found))
    }
}

impl FragmentHost for Engine {
    fn fragment(&self, template: &str, fragment: &str) -> Result<Option<Arc<Fragment>>, RenderError> {
        self.compile_fragment(template, fragment).map_err(|e| match e {
            Error::Render(e) => e,
            other => RenderError::Failed(format!("embedding {template}::{fragment}: {other}")),
        })
    }
}
