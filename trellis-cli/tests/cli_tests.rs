use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::json;
use trellis_cli::Overrides;
use trellis_compiler::Engine;

fn project(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, content) in files {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    dir
}

fn engine(dir: &Path, overrides: &Overrides) -> Engine {
    let config = trellis_cli::load_config(dir, overrides).expect("config");
    Engine::from_config(&config)
}

#[test]
fn overrides_win_over_the_config_file() {
    let dir = project(&[("trellis.toml", "templates = 'views'\n[compiler]\nstrict = true\n")]);
    let overrides = Overrides {
        templates: Some(dir.path().join("other")),
        no_cache: true,
        lenient: true,
        ..Default::default()
    };
    let config = trellis_cli::load_config(dir.path(), &overrides).unwrap();
    assert_eq!(config.templates, dir.path().join("other"));
    assert!(!config.cache.enabled);
    assert!(!config.compiler.strict);
}

#[test]
fn compile_and_render_templates() {
    let dir = project(&[
        ("templates/a.html", "<p>{x}</p>"),
        ("templates/b.html", "<b>b</b>"),
    ]);
    let engine = engine(dir.path(), &Overrides::default());

    let single = trellis_cli::compile_cmd(&engine, &["a".to_string()]).unwrap();
    assert!(single.starts_with("#!trellis 1"));
    let bundle = trellis_cli::compile_cmd(&engine, &["a".to_string(), "b".to_string()]).unwrap();
    assert_eq!(bundle.matches("#!trellis").count(), 1);
    assert!(trellis_cli::compile_cmd(&engine, &[]).is_err());

    let data_path = dir.path().join("data.json");
    fs::write(&data_path, r#"{"x": "<y>"}"#).unwrap();
    let data = trellis_cli::read_data(Some(&data_path)).unwrap();
    assert_eq!(data, json!({"x": "<y>"}));
    assert_eq!(
        trellis_cli::render_cmd(&engine, "a", &data).unwrap(),
        "<p>&lt;y&gt;</p>"
    );

    let out = dir.path().join("out/a.txt");
    trellis_cli::emit("hello", Some(&out)).unwrap();
    assert_eq!(fs::read_to_string(out).unwrap(), "hello");
}

#[test]
fn check_reports_every_broken_template() {
    let dir = project(&[
        ("templates/good.html", "<p>{x}</p>"),
        ("templates/bad.html", "<p directive:9nope=\"1\">x</p>"),
        ("templates/broken.html", "<div>"),
    ]);
    let engine = engine(dir.path(), &Overrides::default());
    let report = trellis_cli::check_cmd(&engine, &[]).unwrap();
    assert!(!report.ok());
    assert_eq!(report.passed, ["good.html"]);
    let failed: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(failed, ["bad.html", "broken.html"]);

    let lenient = engine_with_lenient(dir.path());
    let report = trellis_cli::check_cmd(&lenient, &["bad".to_string()]).unwrap();
    assert!(report.ok());
}

fn engine_with_lenient(dir: &Path) -> Engine {
    engine(
        dir,
        &Overrides {
            lenient: true,
            ..Default::default()
        },
    )
}

#[test]
fn cache_warm_and_clear_on_disk() {
    let dir = project(&[
        ("trellis.toml", "[cache]\ndir = '.cache'\n"),
        ("templates/a.html", "<p>a</p>"),
        ("templates/nested/b.html", "<p>b</p>"),
    ]);
    let engine = engine(dir.path(), &Overrides::default());
    let report = trellis_cli::cache_warm(&engine).unwrap();
    assert_eq!(report.compiled, ["a.html", "nested/b.html"]);
    let cached = fs::read_dir(dir.path().join(".cache")).unwrap().count();
    assert_eq!(cached, 2);

    trellis_cli::cache_clear(&engine).unwrap();
    let cached = fs::read_dir(dir.path().join(".cache")).unwrap().count();
    assert_eq!(cached, 0);
}

#[test]
fn latest_mtime_tracks_nested_files() {
    let dir = project(&[("templates/a.html", "a")]);
    let before = trellis_cli::latest_mtime(dir.path());
    std::thread::sleep(Duration::from_millis(20));
    fs::write(dir.path().join("templates/new.html"), "n").unwrap();
    assert!(trellis_cli::latest_mtime(dir.path()) >= before);

    let engine = engine(dir.path(), &Overrides::default());
    trellis_cli::watch_cmd(
        &engine,
        &dir.path().join("templates"),
        &[],
        Duration::from_millis(1),
        Some(2),
    )
    .unwrap();
}
