use std::fs;
use std::sync::Arc;
use std::thread;

use serde_json::json;
use trellis_compiler::{
    CacheEntry, CacheStore, CompileError, Engine, EngineConfig, Error, FsCacheStore, MemoryCacheStore,
    MemoryLoader, fingerprint,
};

fn setup(templates: &[(&str, &str)]) -> (Arc<MemoryLoader>, Arc<MemoryCacheStore>, Engine) {
    let loader = Arc::new(MemoryLoader::with(templates.iter().copied()));
    let cache = Arc::new(MemoryCacheStore::new());
    let engine = Engine::new(loader.clone()).with_cache(Some(cache.clone()));
    (loader, cache, engine)
}

#[test]
fn render_fills_the_cache_and_compile_bypasses_it() {
    let (_, cache, engine) = setup(&[("page.html", "<p>{x}</p>")]);
    engine.compile("page.html", "<p>{x}</p>").unwrap();
    assert!(cache.is_empty());

    assert_eq!(engine.render("page.html", &json!({"x": 1})).unwrap(), "<p>1</p>");
    assert_eq!(cache.len(), 1);
    let entry = cache
        .get("page.html", &fingerprint("<p>{x}</p>"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.code, engine.compile_template("page.html").unwrap());
}

#[test]
fn cache_hits_reuse_stored_code() {
    let (_, cache, engine) = setup(&[("page.html", "<p>real</p>")]);
    engine.render("page.html", &json!({})).unwrap();

    // a hit is served from the store, so doctored code shows through
    let fp = fingerprint("<p>real</p>");
    let mut entry = cache.get("page.html", &fp).unwrap().unwrap();
    entry.code = entry.code.replace("real", "cached");
    cache.put(&entry).unwrap();
    assert_eq!(engine.render("page.html", &json!({})).unwrap(), "<p>cached</p>");
}

#[test]
fn edited_templates_and_dependencies_recompile() {
    let (loader, _, engine) = setup(&[
        ("partials/nav.html", r#"<nav directive:fragment="nav">v1</nav>"#),
        ("page.html", r#"<div directive:replace="partials/nav.html :: nav"></div>"#),
    ]);
    assert_eq!(engine.render("page.html", &json!({})).unwrap(), "<nav>v1</nav>");

    loader.insert("partials/nav.html", r#"<nav directive:fragment="nav">v2</nav>"#);
    assert_eq!(engine.render("page.html", &json!({})).unwrap(), "<nav>v2</nav>");

    loader.insert("page.html", r#"<main directive:replace="partials/nav.html :: nav"></main>"#);
    assert_eq!(engine.render("page.html", &json!({})).unwrap(), "<nav>v2</nav>");
}

#[test]
fn invalidate_and_clear() {
    let (_, cache, engine) = setup(&[("a.html", "a"), ("b.html", "b")]);
    engine.render("a.html", &json!({})).unwrap();
    engine.render("b.html", &json!({})).unwrap();
    assert_eq!(cache.len(), 2);

    let fp = fingerprint("a");
    let mut fragment = CacheEntry::new(
        "a.html::card",
        &fp,
        [("a.html".to_string(), fp.clone())].into(),
        "#!trellis 1\n".into(),
    );
    fragment.params = vec!["title".into()];
    cache.put(&fragment).unwrap();
    assert_eq!(cache.len(), 3);

    // the template's fragment entries go with it
    engine.invalidate("a.html").unwrap();
    assert_eq!(cache.len(), 1);
    assert!(cache.get("b.html", &fingerprint("b")).unwrap().is_some());
    engine.clear_cache().unwrap();
    assert!(cache.is_empty());
}

#[test]
fn warm_reports_failures_without_stopping() {
    let (_, cache, engine) = setup(&[
        ("good.html", "<p>{x}</p>"),
        ("bad.html", "<p directive:if=\"(\">x</p>"),
        ("also_good.html", "<b>b</b>"),
    ]);
    let report = engine.warm().unwrap();
    assert_eq!(report.compiled, ["also_good.html", "good.html"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "bad.html");
    assert!(matches!(
        report.failed[0].1,
        Error::Compile(CompileError::Expression { .. })
    ));
    assert_eq!(cache.len(), 2);
}

#[test]
fn bundles_render_back_to_back() {
    let (_, _, engine) = setup(&[("head.html", "<h1>{title}</h1>"), ("body.html", "<p>{text}</p>")]);
    let out = engine
        .render_bundle(&["head.html", "body.html"], &json!({"title": "T", "text": "B"}))
        .unwrap();
    assert_eq!(out, "<h1>T</h1><p>B</p>");
}

#[test]
fn engine_without_cache_still_renders() {
    let loader = Arc::new(MemoryLoader::with([("a.html", "<i>{v}</i>")]));
    let engine = Engine::new(loader).with_cache(None);
    assert_eq!(engine.render("a.html", &json!({"v": "ok"})).unwrap(), "<i>ok</i>");
}

#[test]
fn unwritable_cache_falls_back_to_compiling() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "file").unwrap();
    let loader = Arc::new(MemoryLoader::with([("a.html", "<i>{v}</i>")]));
    let store = FsCacheStore::new(blocker.join("cache"));
    let engine = Engine::new(loader).with_cache(Some(Arc::new(store)));

    for _ in 0..2 {
        assert_eq!(engine.render("a.html", &json!({"v": "ok"})).unwrap(), "<i>ok</i>");
    }
    assert!(blocker.is_file());
}

#[test]
fn missing_templates_are_load_errors() {
    let (_, _, engine) = setup(&[]);
    assert!(matches!(
        engine.render("nope.html", &json!({})),
        Err(Error::Load(_))
    ));
}

#[test]
fn fs_cache_survives_engine_restarts() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("templates")).unwrap();
    fs::write(dir.path().join("templates/hello.html"), "<p>Hello {name}</p>").unwrap();
    fs::write(
        dir.path().join("trellis.toml"),
        "[cache]\ndir = 'cache'\n",
    )
    .unwrap();

    let config = EngineConfig::discover(dir.path()).unwrap();
    let first = Engine::from_config(&config);
    assert_eq!(
        first.render("hello", &json!({"name": "Ann"})).unwrap(),
        "<p>Hello Ann</p>"
    );
    let store = FsCacheStore::new(dir.path().join("cache"));
    let fp = fingerprint("<p>Hello {name}</p>");
    let entry = store.get("hello.html", &fp).unwrap().unwrap();
    assert_eq!(entry.dependencies.get("hello.html"), Some(&fp));

    let second = Engine::from_config(&config);
    assert_eq!(second.compile_template("hello").unwrap(), entry.code);

    fs::write(dir.path().join("templates/hello.html"), "<p>Hi {name}</p>").unwrap();
    assert_eq!(
        second.render("hello", &json!({"name": "Ann"})).unwrap(),
        "<p>Hi Ann</p>"
    );
    assert_eq!(store.get("hello.html", &fp).unwrap(), None);
}

#[test]
fn fs_cache_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsCacheStore::new(dir.path()));
    let fp = fingerprint("<p>x</p>");
    let entry = CacheEntry::new(
        "page.html",
        &fp,
        [("page.html".to_string(), fp.clone())].into(),
        "#!trellis 1\n".into(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let entry = entry.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    store.put(&entry).unwrap();
                    // readers see either nothing or a whole entry
                    match store.get("page.html", &entry.fingerprint).unwrap() {
                        None => {}
                        Some(read) => assert_eq!(read, entry),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.get("page.html", &fp).unwrap(), Some(entry));
}
