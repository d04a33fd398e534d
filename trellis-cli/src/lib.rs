use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use trellis_compiler::{Engine, EngineConfig, TemplateLoader, WarmReport};

/// Command line overrides applied on top of `trellis.toml`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub templates: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub lenient: bool,
}

/// Read `<dir>/trellis.toml` (or defaults) and apply `overrides`.
pub fn load_config(dir: &Path, overrides: &Overrides) -> Result<EngineConfig> {
    let mut config = EngineConfig::discover(dir)
        .with_context(|| format!("failed to load configuration from {}", dir.display()))?;
    if let Some(templates) = &overrides.templates {
        config.templates = templates.clone();
    }
    if let Some(cache_dir) = &overrides.cache_dir {
        config.cache.dir = Some(cache_dir.clone());
    }
    if overrides.no_cache {
        config.cache.enabled = false;
    }
    if overrides.lenient {
        config.compiler.strict = false;
    }
    tracing::debug!(templates = %config.templates.display(), cache = config.cache.enabled, "configuration");
    Ok(config)
}

/// Program text for `names`: one template, or several linked into a bundle.
pub fn compile_cmd(engine: &Engine, names: &[String]) -> Result<String> {
    match names {
        [] => anyhow::bail!("no template given"),
        [name] => engine
            .compile_template(name)
            .with_context(|| format!("failed to compile {name}")),
        _ => {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            engine
                .compile_bundle(&names)
                .context("failed to compile bundle")
        }
    }
}

/// Write `text` to `out`, or stdout without one.
pub fn emit(text: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "written");
        }
        None => print!("{text}"),
    }
    Ok(())
}

/// Bindings from a JSON file, `-` for stdin, or an empty object.
pub fn read_data(path: Option<&Path>) -> Result<Value> {
    let text = match path {
        None => return Ok(Value::Object(Default::default())),
        Some(p) if p == Path::new("-") => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("failed to read bindings from stdin")?;
            text
        }
        Some(p) => fs::read_to_string(p).with_context(|| format!("failed to read {}", p.display()))?,
    };
    serde_json::from_str(&text).context("bindings are not valid JSON")
}

pub fn render_cmd(engine: &Engine, name: &str, data: &Value) -> Result<String> {
    engine
        .render(name, data)
        .with_context(|| format!("failed to render {name}"))
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub passed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Compile `names` (every template when empty) without touching the cache.
pub fn check_cmd(engine: &Engine, names: &[String]) -> Result<CheckReport> {
    let names = if names.is_empty() {
        engine.loader().names().context("failed to list templates")?
    } else {
        names.to_vec()
    };
    let mut report = CheckReport::default();
    for name in names {
        let result = engine
            .loader()
            .load(&name)
            .map_err(trellis_compiler::Error::from)
            .and_then(|t| engine.compile(&t.identity, &t.source));
        match result {
            Ok(_) => report.passed.push(name),
            Err(e) => report.failed.push((name, e.to_string())),
        }
    }
    Ok(report)
}

pub fn cache_clear(engine: &Engine) -> Result<()> {
    engine.clear_cache().context("failed to clear the cache")
}

pub fn cache_warm(engine: &Engine) -> Result<WarmReport> {
    engine.warm().context("failed to warm the cache")
}

/// Newest modification time of any file under `dir`.
pub fn latest_mtime(dir: &Path) -> SystemTime {
    fn walk(p: &Path, cur: &mut SystemTime) {
        let Ok(listing) = fs::read_dir(p) else {
            return;
        };
        for entry in listing.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, cur);
            } else if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified > *cur {
                    *cur = modified;
                }
            }
        }
    }
    let mut latest = SystemTime::UNIX_EPOCH;
    walk(dir, &mut latest);
    latest
}

/// Poll `dir` and re-check `names` whenever something under it changes.
/// Runs until `rounds` polls have passed, or forever without a limit.
pub fn watch_cmd(
    engine: &Engine,
    dir: &Path,
    names: &[String],
    interval: Duration,
    rounds: Option<usize>,
) -> Result<()> {
    let mut last = latest_mtime(dir);
    println!("[watch] Watching {}", dir.display());
    report_check(&check_cmd(engine, names)?);

    let mut polled = 0;
    while rounds.is_none_or(|limit| polled < limit) {
        thread::sleep(interval);
        polled += 1;
        let now = latest_mtime(dir);
        if now <= last {
            continue;
        }
        last = now;
        println!("[watch] Change detected, recompiling");
        report_check(&check_cmd(engine, names)?);
    }
    Ok(())
}

/// Print a check report: failures to stderr, a summary to stdout.
pub fn report_check(report: &CheckReport) {
    for (name, error) in &report.failed {
        eprintln!("error: {name}: {error}");
    }
    println!(
        "{} template(s) ok, {} failed",
        report.passed.len(),
        report.failed.len()
    );
}
