use std::sync::Arc;

use super::*;
use crate::engine::{Minifier, Stage, StageKind, StageOrigin, Workflow};
use crate::nut::NutsHeap;
use crate::store::MemoryStore;

fn workflow(files: &[(&str, &str)], paths: &[&str], minify: bool) -> (Workflow, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::in_memory("mem"));
    for (path, content) in files {
        store.put(*path, content.as_bytes().to_vec());
    }
    let heap = NutsHeap::builder("site")
        .store(StoreRef::new("mem", store.clone()))
        .paths(paths.iter().copied())
        .build()
        .unwrap();
    let stages = [
        Stage::new(
            "inspector",
            Category::Inspector,
            [NutType::Css, NutType::Html, NutType::Javascript],
            StageOrigin::Core,
            StageKind::Inspector(Arc::new(InspectorStage::with_defaults(true))),
        ),
        Stage::new(
            "minifier",
            Category::Minification,
            [NutType::Css, NutType::Javascript],
            StageOrigin::Core,
            StageKind::Minifier(Arc::new(Minifier::new(minify))),
        ),
    ];
    (Workflow::new("wf", heap, &stages), store)
}

fn run(wf: &Workflow) -> Result<(String, ConvertibleNut)> {
    let request = wf.request().build()?;
    let mut out = wf.execute(&request)?;
    let mut nut = out.remove(0);
    let bytes = nut.transform(Vec::new())?;
    Ok((String::from_utf8(bytes).unwrap(), nut))
}

fn version_of(store: &MemoryStore, path: &str) -> u64 {
    store.resolve(path, PatternMode::Exact).unwrap()[0].version().get().unwrap()
}

#[test]
fn test_apply_descending() {
    let text = "url(a) url(bb) url(c)".to_string();
    let replacements = vec![
        Replacement { start: 4, end: 5, text: "/x/1/a".into() },
        Replacement { start: 19, end: 20, text: "/x/3/c".into() },
        Replacement { start: 11, end: 13, text: "/x/2/bb".into() },
    ];
    let out = apply(text, replacements);
    assert_eq!(out, "url(/x/1/a) url(/x/2/bb) url(/x/3/c)");
}

#[test]
fn test_apply_drops_overlaps() {
    let out = apply(
        "abcdef".to_string(),
        vec![
            Replacement { start: 1, end: 4, text: "X".into() },
            Replacement { start: 3, end: 5, text: "Y".into() },
        ],
    );
    assert_eq!(out, "abcYf");
}

#[test]
fn test_rescan_finds_no_original_ranges() {
    let text = "a{background:url(img/a.png)}\nb{background:url(img/b.png)}\n";
    let mut inspector = CssInspector::default();
    let refs = collect(&mut inspector, text);
    let replacements = refs
        .iter()
        .map(|r| Replacement { start: r.start, end: r.end, text: "https://cdn/x.png".into() })
        .collect();
    let out = apply(text.to_string(), replacements);

    let again = collect(&mut inspector, &out);
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|r| r.target == Target::Path("https://cdn/x.png".into())));
}

#[test]
fn test_version_query() {
    assert_eq!(version_query("a.js", 7), "a.js?versionNumber=7");
    assert_eq!(version_query("a.js?v=1", 7), "a.js?v=1&versionNumber=7");
    assert_eq!(version_query("a.svg#icon", 7), "a.svg?versionNumber=7#icon");
}

#[test]
fn test_css_references_rewritten() {
    let css = "a{background:url(../img/bg.png)}\nb{background:url('missing.png#frag')}\nc{background:url(data:image/png;base64,AAAA)}\n";
    let (wf, store) = workflow(&[("css/main.css", css), ("img/bg.png", "PNG")], &["css/main.css"], false);
    let (out, nut) = run(&wf).unwrap();

    let image = version_of(&store, "img/bg.png");
    let referencer = version_of(&store, "css/main.css");
    assert!(out.contains(&format!("url(/wf/{image}/img/bg.png)")), "{out}");
    assert!(out.contains(&format!("url('missing.png?versionNumber={referencer}#frag')")), "{out}");
    assert!(out.contains("url(data:image/png;base64,AAAA)"));

    let names: Vec<&str> = nut.referenced().iter().map(ConvertibleNut::name).collect();
    assert_eq!(names, vec!["img/bg.png"]);
    assert!(nut.referenced()[0].is_sub_resource());
}

#[test]
fn test_html_scan_fallback() {
    let html = r#"<script src="js/missing.js"></script>
<script src="js/app.js"></script>
<link rel="stylesheet" href="css/site.css">"#;
    let (wf, store) = workflow(
        &[("index.html", html), ("js/app.js", "var app;"), ("css/site.css", "body{}")],
        &["index.html"],
        false,
    );
    let (out, nut) = run(&wf).unwrap();

    let page = version_of(&store, "index.html");
    let app = version_of(&store, "js/app.js");
    let site = version_of(&store, "css/site.css");
    assert!(out.contains(&format!(r#"src="js/missing.js?versionNumber={page}""#)), "{out}");
    assert!(out.contains(&format!(r#"src="/wf/{app}/js/app.js""#)), "{out}");
    assert!(out.contains(&format!(r#"href="/wf/{site}/css/site.css""#)), "{out}");
    assert_eq!(nut.referenced().len(), 2);
}

#[test]
fn test_inline_content_processed_in_place() {
    let html = "<style>\nbody {\n  color: #ff0000;\n}\n</style><p>hi</p>";
    let (wf, _) = workflow(&[("index.html", html)], &["index.html"], true);
    let (out, _) = run(&wf).unwrap();
    assert_eq!(out, "<style>body{color:red}</style><p>hi</p>");
}

#[test]
fn test_unreachable_path_aborts() {
    let (wf, _) = workflow(&[("main.css", "a{background:url(../../up.png)}")], &["main.css"], false);
    let err = run(&wf).unwrap_err();
    assert!(matches!(err, Error::UnreachablePath { .. }), "{err}");
}

#[test]
fn test_missing_source_map_comment_removed() {
    let js = "var a;\n//# sourceMappingURL=a.js.map\n";
    let (wf, _) = workflow(&[("a.js", js)], &["a.js"], false);
    let (out, _) = run(&wf).unwrap();
    assert_eq!(out, "var a;\n\n");
}

#[test]
fn test_import_cycle_terminates() {
    let (wf, store) = workflow(
        &[("a.css", "@import \"b.css\";"), ("b.css", "@import \"a.css\";")],
        &["a.css"],
        false,
    );
    let (out, mut nut) = run(&wf).unwrap();
    let b = version_of(&store, "b.css");
    assert_eq!(out, format!("@import \"/wf/{b}/b.css\";"));

    let mut b_nut = nut.take_referenced().remove(0);
    let b_out = String::from_utf8(b_nut.transform(Vec::new()).unwrap()).unwrap();
    let a = version_of(&store, "a.css");
    assert_eq!(b_out, format!("@import \"/wf/{a}/a.css\";"));
    assert!(b_nut.referenced().is_empty());
}
