use std::sync::Arc;

use serde_json::json;
use trellis_compiler::{CompileError, Engine, Error, MemoryLoader};

fn engine(templates: &[(&str, &str)]) -> (Arc<MemoryLoader>, Engine) {
    let loader = Arc::new(MemoryLoader::with(templates.iter().copied()));
    let engine = Engine::new(loader.clone());
    (loader, engine)
}

const CARD: &str = r#"<article directive:fragment="card(title, body)"><h2>{title}</h2><p>{body}</p></article>"#;

#[test]
fn replace_inlines_fragment_with_arguments() {
    let (_, engine) = engine(&[
        ("partials/card.html", CARD),
        (
            "page.html",
            r#"<section directive:replace="partials/card.html :: card(post.title, body: post.body)">x</section>"#,
        ),
    ]);
    let out = engine
        .render("page.html", &json!({"post": {"title": "T", "body": "B"}}))
        .unwrap();
    assert_eq!(out, "<article><h2>T</h2><p>B</p></article>");
}

#[test]
fn include_keeps_host_element() {
    let (_, engine) = engine(&[
        ("partials/card.html", CARD),
        (
            "page.html",
            r#"<div class="slot" directive:include="partials/card.html :: card('X')"></div>"#,
        ),
    ]);
    // missing arguments bind null
    assert_eq!(
        engine.render("page.html", &json!({})).unwrap(),
        r#"<div class="slot"><h2>X</h2><p></p></div>"#
    );
}

#[test]
fn fragment_parameters_hide_caller_locals() {
    let (_, engine) = engine(&[
        ("partials/item.html", r#"<b directive:fragment="item(label)">{label}{n}</b>"#),
        (
            "page.html",
            r#"<i directive:repeat="n nums" directive:replace="partials/item.html :: item(n)"></i>"#,
        ),
    ]);
    // inside the fragment `n` is not the loop variable but a root lookup
    let out = engine
        .render("page.html", &json!({"nums": [1, 2], "n": "!"}))
        .unwrap();
    assert_eq!(out, "<b>1!</b><b>2!</b>");
}

#[test]
fn local_fragments_and_declarations_render_in_place() {
    let (_, engine) = engine(&[(
        "page.html",
        r#"<nav directive:fragment="menu"><a>home</a></nav><footer directive:include=":: menu"></footer>"#,
    )]);
    assert_eq!(
        engine.render("page.html", &json!({})).unwrap(),
        "<nav><a>home</a></nav><footer><a>home</a></footer>"
    );
}

#[test]
fn extends_fills_layout_slots() {
    let (_, engine) = engine(&[
        (
            "layout.html",
            r#"<html><head><title directive:fragment="title">Site</title></head><body><main directive:fragment="content">empty</main></body></html>"#,
        ),
        (
            "page.html",
            r#"<html directive:extends="layout.html"><main directive:fragment="content"><p>{msg}</p></main></html>"#,
        ),
    ]);
    assert_eq!(
        engine.render("page.html", &json!({"msg": "hi"})).unwrap(),
        "<html><head><title>Site</title></head><body><main><p>hi</p></main></body></html>"
    );
}

#[test]
fn extends_rejects_unknown_slots_and_missing_layouts() {
    let (_, engine) = engine(&[
        ("layout.html", r#"<main directive:fragment="content"></main>"#),
        (
            "bad_slot.html",
            r#"<div directive:extends="layout.html"><p directive:fragment="sidebar">x</p></div>"#,
        ),
        ("no_layout.html", r#"<div directive:extends="missing.html"></div>"#),
    ]);
    assert!(matches!(
        engine.render("bad_slot.html", &json!({})),
        Err(Error::Compile(CompileError::Directive { .. }))
    ));
    assert!(matches!(
        engine.render("no_layout.html", &json!({})),
        Err(Error::Compile(CompileError::FragmentNotFound { .. }))
    ));
}

#[test]
fn include_falls_back_to_host_content() {
    let (_, engine) = engine(&[(
        "page.html",
        r#"<div directive:include="nowhere.html :: card"><p>fallback</p></div>"#,
    )]);
    assert_eq!(
        engine.render("page.html", &json!({})).unwrap(),
        "<div><p>fallback</p></div>"
    );
}

#[test]
fn unresolved_fragments_embed_at_render_time() {
    const PAGE: &str = r#"<div directive:replace="late.html :: note(msg, tone: 'loud')"></div>"#;
    let (loader, engine) = engine(&[("page.html", PAGE)]);
    let compiled = engine.compile("page.html", PAGE).unwrap();
    assert!(compiled.code.contains("embed \"late.html\" \"note\""));

    // the program is cached with the embed even though rendering fails
    assert!(matches!(
        engine.render("page.html", &json!({"msg": "hey"})),
        Err(Error::Render(_))
    ));
    loader.insert("late.html", r#"<em directive:fragment="note(text, tone)">{text}/{tone}</em>"#);
    assert_eq!(
        engine.render("page.html", &json!({"msg": "hey"})).unwrap(),
        "<em>hey/loud</em>"
    );
}

#[test]
fn cycles_are_detected() {
    let (_, engine) = engine(&[
        ("a.html", r#"<div directive:include="b.html"></div>"#),
        ("b.html", r#"<p directive:include="a.html"></p>"#),
        ("self.html", r#"<ul directive:fragment="tree"><li directive:include=":: tree"></li></ul>"#),
    ]);
    match engine.render("a.html", &json!({})) {
        Err(Error::Compile(CompileError::Cycle { chain })) => {
            assert_eq!(chain.first().map(String::as_str), Some("a.html"));
            assert_eq!(chain.last().map(String::as_str), Some("a.html"));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(matches!(
        engine.render("self.html", &json!({})),
        Err(Error::Compile(CompileError::Cycle { .. }))
    ));
}

#[test]
fn too_many_arguments_is_an_error() {
    let (_, engine) = engine(&[
        ("partials/card.html", CARD),
        ("page.html", r#"<div directive:replace="partials/card.html :: card(1, 2, 3)"></div>"#),
    ]);
    assert!(matches!(
        engine.render("page.html", &json!({})),
        Err(Error::Compile(CompileError::Directive { .. }))
    ));
}
