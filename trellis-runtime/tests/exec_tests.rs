use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use trellis_runtime::{
    Fragment, FragmentHost, HelperRegistry, PRELUDE, Program, RenderError, Runtime, render_program,
};

fn program(body: &str) -> String {
    format!("{PRELUDE}{body}")
}

#[test]
fn loop_over_object_keeps_order_and_binds_key() {
    let src = program(
        r#"for ($key, $item in lookup($, "items")) {
echo "(";
print $key;
echo ",";
print $item;
echo ")";
}"#,
    );
    let data: serde_json::Value = serde_json::from_str(r#"{"items": {"a": 1, "b": 2}}"#).unwrap();
    assert_eq!(render_program(&src, &data).unwrap(), "(a,1)(b,2)");
}

#[test]
fn loop_over_null_renders_nothing_and_scalars_fail() {
    let src = program(r#"for ($x in lookup($, "missing")) { print $x; }"#);
    assert_eq!(render_program(&src, &json!({})).unwrap(), "");

    let src = program(r#"for ($x in lookup($, "n")) { print $x; }"#);
    let err = render_program(&src, &json!({"n": 5})).unwrap_err();
    assert_eq!(err, RenderError::NotIterable("number"));
}

#[test]
fn with_scope_hides_outer_variables() {
    let src = program(
        r#"for ($item in lookup($, "xs")) {
with ($label = $item) { print $label; print $item; }
}"#,
    );
    let err = render_program(&src, &json!({"xs": [1]})).unwrap_err();
    assert_eq!(err, RenderError::UndefinedVariable("item".into()));
}

#[test]
fn with_evaluates_all_arguments_before_binding() {
    let src = program(
        r#"let $a = "A";
let $b = "B";
{ with ($a = $b, $b = $a) { print $a; print $b; } }"#,
    );
    // a swap only works if both arguments see the caller's values
    assert_eq!(render_program(&src, &json!({})).unwrap(), "BA");
}

#[test]
fn if_else_chain() {
    let src = program(
        r#"let $role = lookup($, "role");
if ($role == "admin") { echo "A"; } else if ($role == "user") { echo "U"; } else { echo "?"; }"#,
    );
    assert_eq!(render_program(&src, &json!({"role": "user"})).unwrap(), "U");
    assert_eq!(render_program(&src, &json!({"role": "x"})).unwrap(), "?");
}

#[test]
fn attr_and_escape_helpers() {
    let src = program(r#"echo "<a"; print attr("href", lookup($, "url")); echo ">"; print escape(lookup($, "t")); echo "</a>";"#);
    let out = render_program(&src, &json!({"url": "/a?b=1&c=2", "t": "<b>"})).unwrap();
    assert_eq!(out, r#"<a href="/a?b=1&amp;c=2">&lt;b&gt;</a>"#);

    let out = render_program(&src, &json!({"t": "x"})).unwrap();
    assert_eq!(out, "<a>x</a>");
}

#[test]
fn unknown_static_helper_is_rejected_at_load() {
    let runtime = Runtime::default();
    let err = runtime.load(&program("print sys.exec(\"ls\");")).unwrap_err();
    assert_eq!(err, RenderError::UnknownHelper("sys.exec".into()));
}

#[test]
fn runtimes_do_not_share_helpers() {
    let mut custom = HelperRegistry::standard();
    custom.register("app.greet", |_| Ok(json!("hi"))).unwrap();
    let with_custom = Runtime::new(custom);
    let plain = Runtime::default();

    let src = program("print app.greet();");
    let p = with_custom.load(&src).unwrap();
    assert_eq!(with_custom.execute(&p, &json!({}), &trellis_runtime::NoFragments).unwrap(), "hi");
    assert!(plain.load(&src).is_err());
}

struct MapHost(HashMap<(String, String), Arc<Fragment>>);

impl FragmentHost for MapHost {
    fn fragment(&self, template: &str, fragment: &str) -> Result<Option<Arc<Fragment>>, RenderError> {
        Ok(self.0.get(&(template.to_string(), fragment.to_string())).cloned())
    }
}

#[test]
fn embed_binds_params_and_defaults_missing_to_null() {
    let card = Program::parse(&program(r#"echo "["; print $title; echo "|"; print $body; echo "]";"#)).unwrap();
    let mut map = HashMap::new();
    map.insert(
        ("cards.html".to_string(), "card".to_string()),
        Arc::new(Fragment {
            params: vec!["title".into(), "body".into()],
            program: card,
        }),
    );
    let host = MapHost(map);

    let runtime = Runtime::default();
    let p = runtime
        .load(&program(r#"embed "cards.html" "card" ($title = lookup($, "t"));"#))
        .unwrap();
    assert_eq!(runtime.execute(&p, &json!({"t": "Hi"}), &host).unwrap(), "[Hi|]");

    let missing = runtime
        .load(&program(r#"embed "cards.html" "nope" ();"#))
        .unwrap();
    let err = runtime.execute(&missing, &json!({}), &host).unwrap_err();
    assert!(matches!(err, RenderError::FragmentNotFound { ref fragment, .. } if fragment == "nope"));
}

#[test]
fn self_embedding_fragment_hits_depth_limit() {
    let looping = Program::parse(&program(r#"embed "a.html" "x" ();"#)).unwrap();
    let mut map = HashMap::new();
    map.insert(
        ("a.html".to_string(), "x".to_string()),
        Arc::new(Fragment {
            params: vec![],
            program: looping.clone(),
        }),
    );
    let host = MapHost(map);
    let err = Runtime::default().execute(&looping, &json!({}), &host).unwrap_err();
    assert!(matches!(err, RenderError::EmbedDepth(_)));
}

#[test]
fn unknown_statements_are_syntax_errors() {
    let err = render_program(&program(r#"abort "stop";"#), &json!({})).unwrap_err();
    assert!(matches!(err, RenderError::Syntax(_)));
}
