//! End-to-end builds over fixture projects.
//!
//! Bundles are executed with `node` when it is on `PATH`; those assertions are
//! skipped otherwise.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weave_core::{
    ArtifactKind, BuildConfig, BuildContext, BuildError, Bundler, Chain, ConfigurationError,
    FileMetadata, IncrementalCache, Mode, Predicate, Registry, StepError, Transform,
    TransformContext, TransformOutput,
};

const ADD: &str = "export default function add(...numbers) {\n  return numbers.reduce((sum, n) => sum + n, 0);\n}\n";

struct Project {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Project {
    fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let project = Self { _dir: dir, root };
        for (path, content) in files {
            project.write(path, content);
        }
        project
    }

    fn write(&self, path: &str, content: &str) -> PathBuf {
        let path = self.root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn config(&self, mode: Mode) -> BuildConfig {
        BuildConfig::new(&self.root, mode).without_persistent_cache()
    }

    fn bundler(&self, mode: Mode) -> Bundler {
        Bundler::new(BuildContext::init(self.config(mode)).unwrap())
    }
}

fn add_project() -> Project {
    Project::new(&[
        (
            "main.js",
            "import add from './src/utils/add';\nimport './src/style.css';\n\nconsole.log(add(3, 3, 4, 5));\n",
        ),
        ("src/utils/add.js", ADD),
        ("src/style.css", "body {\n  color: red;\n}\n"),
    ])
}

/// Run `script` with node, or `None` when node is unavailable.
fn run_node(script: &Path) -> Option<String> {
    let node = which::which("node").ok()?;
    let output = Command::new(node).arg(script).output().unwrap();
    assert!(
        output.status.success(),
        "node failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[test]
fn test_add_bundle_prints_sum_in_development() {
    let project = add_project();
    let mut bundler = project.bundler(Mode::Development);
    let outcome = bundler.build();
    assert!(outcome.is_success(), "{:?}", outcome.errors);
    assert_eq!(outcome.report.modules, 3);

    let written = bundler.write(&outcome).unwrap();
    let script = project.root.join("dist/js/main.js");
    assert!(written.contains(&script));
    assert!(project.root.join("dist/js/main.js.map").is_file());

    let code = std::fs::read_to_string(&script).unwrap();
    assert!(code.contains("document.createElement(\"style\")"));

    if let Some(stdout) = run_node(&script) {
        assert_eq!(stdout, "15\n");
    }
}

#[test]
fn test_add_bundle_prints_sum_in_production() {
    let project = add_project();
    let mut bundler = project.bundler(Mode::Production);
    let outcome = bundler.build();
    assert!(outcome.is_success(), "{:?}", outcome.errors);

    let kinds: Vec<(ArtifactKind, &str)> = outcome
        .artifacts
        .iter()
        .map(|a| (a.kind, a.name.as_str()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (ArtifactKind::Script, "js/main.js"),
            (ArtifactKind::Style, "css/main.css"),
        ]
    );
    bundler.write(&outcome).unwrap();

    let css = std::fs::read_to_string(project.root.join("dist/css/main.css")).unwrap();
    assert!(css.contains("color:red"));
    let code = std::fs::read_to_string(project.root.join("dist/js/main.js")).unwrap();
    assert!(!code.starts_with("// weave"));

    if let Some(stdout) = run_node(&project.root.join("dist/js/main.js")) {
        assert_eq!(stdout, "15\n");
    }
}

#[test]
fn test_regex_literals_and_shadowed_imports_run_in_node() {
    let project = Project::new(&[
        (
            "main.js",
            "import add from './add';\nimport { strip } from './lib';\n\nfunction twice(add) {\n  return add * 2;\n}\nconst inc = (add) => add + 1;\nconsole.log(`${add(1, 2)} ${twice(4)} ${inc(1)} ${strip('(7')}`);\n",
        ),
        ("add.js", ADD),
        (
            "lib.js",
            "const open = /[{(]/g;\nexport const strip = (s) => s.replace(open, '');\nexport const x = strip('(7');\n",
        ),
    ]);

    for mode in [Mode::Development, Mode::Production] {
        let mut bundler = project.bundler(mode);
        let outcome = bundler.build();
        assert!(outcome.is_success(), "{:?}", outcome.errors);
        bundler.write(&outcome).unwrap();

        let code = std::fs::read_to_string(project.root.join("dist/js/main.js")).unwrap();
        assert!(!code.contains("export const"), "{code}");
        assert!(code.contains("function twice(add)"), "{code}");

        if let Some(stdout) = run_node(&project.root.join("dist/js/main.js")) {
            assert_eq!(stdout, "3 8 2 7\n");
        }
    }
}

/// Argument of the `url()` following `selector` in `css`, without quotes.
fn url_after<'a>(css: &'a str, selector: &str) -> &'a str {
    let start = css.find(selector).unwrap();
    let open = start + css[start..].find("url(").unwrap() + 4;
    let close = open + css[open..].find(')').unwrap();
    css[open..close].trim_matches(|c| c == '"' || c == '\'' || c == '\\')
}

#[test]
fn test_style_urls_resolve_to_assets() {
    let project = Project::new(&[
        ("main.js", "import './src/hero.css';\nconsole.log('ok');\n"),
        (
            "src/hero.css",
            ".hero {\n  background: url(./logo.png);\n}\n.dot {\n  background: url(\"../img/dot.gif\");\n}\n",
        ),
        ("src/logo.png", "p".repeat(64).as_str()),
        ("img/dot.gif", "gif"),
    ]);

    let mut config = project.config(Mode::Production);
    config.assets.inline_limit = 16;
    let mut bundler = Bundler::new(BuildContext::init(config).unwrap());
    let outcome = bundler.build();
    assert!(outcome.is_success(), "{:?}", outcome.errors);
    assert_eq!(outcome.report.modules, 4);

    let logo = outcome
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Asset)
        .unwrap();
    assert!(logo.name.starts_with("images/") && logo.name.ends_with(".png"));
    bundler.write(&outcome).unwrap();

    let css = std::fs::read_to_string(project.root.join("dist/css/main.css")).unwrap();
    assert!(!css.contains("__weave_url_"), "{css}");
    let hero = url_after(&css, ".hero");
    assert_eq!(hero, format!("../{}", logo.name));
    assert!(project.root.join("dist/css").join(hero).is_file());
    assert_eq!(url_after(&css, ".dot"), "data:image/gif;base64,Z2lm");

    let mut config = project.config(Mode::Development);
    config.assets.inline_limit = 16;
    let outcome = Bundler::new(BuildContext::init(config).unwrap()).build();
    assert!(outcome.is_success(), "{:?}", outcome.errors);
    let code = String::from_utf8_lossy(&outcome.artifacts[0].bytes);
    assert!(code.contains(&logo.name), "{code}");
    assert!(!code.contains(&format!("../{}", logo.name)));
    assert!(!code.contains("__weave_url_"));
}

#[test]
fn test_unchanged_inputs_give_identical_artifacts() {
    let project = add_project();
    let first = project.bundler(Mode::Production).build();
    let second = project.bundler(Mode::Production).build();

    let cache_dir = project.root.join(".cache");
    let config = BuildConfig::new(&project.root, Mode::Production).with_cache_dir(&cache_dir);
    let mut persisted = Bundler::new(BuildContext::init(config).unwrap());
    let third = persisted.build();

    assert!(first.is_success());
    assert_eq!(first.artifacts, second.artifacts);
    assert_eq!(first.artifacts, third.artifacts);
}

#[test]
fn test_import_cycle_resolves_both_modules() {
    let project = Project::new(&[
        (
            "main.js",
            "import { getA, b } from './b';\nimport { a, getB } from './a';\nconsole.log(getA() + getB() + a + b);\n",
        ),
        (
            "a.js",
            "import { b } from './b';\nexport const a = 1;\nexport function getB() {\n  return b;\n}\n",
        ),
        (
            "b.js",
            "import { a } from './a';\nexport const b = 2;\nexport function getA() {\n  return a;\n}\n",
        ),
    ]);
    let mut bundler = project.bundler(Mode::Development);
    let outcome = bundler.build();
    assert!(outcome.is_success(), "{:?}", outcome.errors);
    assert_eq!(outcome.report.modules, 3);
    bundler.write(&outcome).unwrap();

    if let Some(stdout) = run_node(&project.root.join("dist/js/main.js")) {
        assert_eq!(stdout, "6\n");
    }
}

#[test]
fn test_changing_add_reuses_style_result() {
    let project = add_project();
    let mut bundler = project.bundler(Mode::Development);
    let first = bundler.build();
    assert!(first.is_success());
    assert_eq!(first.report.computed, 3);

    let style = project.root.join("src/style.css");
    let style_output = |b: &Bundler| {
        b.graphs()[0]
            .get(&style)
            .and_then(|n| n.output.clone())
            .unwrap()
    };
    let before = style_output(&bundler);

    let add = project.write(
        "src/utils/add.js",
        "export default function add(...numbers) {\n  return numbers.reduce((sum, n) => sum + n, 100);\n}\n",
    );
    let second = bundler.rebuild(&[add]);
    assert!(second.is_success(), "{:?}", second.errors);
    assert_eq!(second.report.dispatched, 1);
    assert_eq!(second.report.computed, 1);
    assert!(Arc::ptr_eq(&before, &style_output(&bundler)));
    assert_eq!(second.report.cache.computed, first.report.cache.computed + 1);
}

#[test]
fn test_renamed_file_hits_cache() {
    let project = add_project();
    let mut bundler = project.bundler(Mode::Development);
    assert!(bundler.build().is_success());

    let old = project.root.join("src/utils/add.js");
    std::fs::remove_file(&old).unwrap();
    let new = project.write("src/utils/sum.js", ADD);
    let main = project.write(
        "main.js",
        "import add from './src/utils/sum';\nimport './src/style.css';\n\nconsole.log(add(3, 3, 4, 5));\n",
    );

    let outcome = bundler.rebuild(&[old.clone(), new.clone(), main]);
    assert!(outcome.is_success(), "{:?}", outcome.errors);
    // Only the entry's content changed; the moved module is served by content.
    assert_eq!(outcome.report.computed, 1);
    assert!(bundler.graphs()[0].contains(&new));
    assert!(!bundler.graphs()[0].contains(&old));
}

#[test]
fn test_missing_import_fails_without_artifacts() {
    let project = Project::new(&[
        ("main.js", "import './missing';\nimport add from './add';\n"),
        ("add.js", ADD),
    ]);
    let mut bundler = project.bundler(Mode::Development);
    let outcome = bundler.build();

    assert!(!outcome.is_success());
    assert!(outcome.artifacts.is_empty());
    match &outcome.errors[..] {
        [BuildError::Resolution(e)] => {
            assert_eq!(e.importer, project.root.join("main.js"));
            assert_eq!(e.specifier, "./missing");
        }
        other => panic!("unexpected errors: {other:?}"),
    }
    // The sibling import was still followed.
    assert!(bundler.graphs()[0].contains(&project.root.join("add.js")));

    assert!(bundler.write(&outcome).unwrap().is_empty());
    assert!(!project.root.join("dist").exists());
}

#[test]
fn test_unmatched_file_aborts_before_transforms() {
    let project = Project::new(&[
        ("main.js", "import './theme.less';\n"),
        ("theme.less", "@c: red;\n"),
    ]);
    let outcome = project.bundler(Mode::Development).build();

    assert_eq!(outcome.report.dispatched, 0);
    assert!(matches!(
        &outcome.errors[..],
        [BuildError::Configuration(ConfigurationError::NoMatchingChain { path })]
            if path.ends_with("theme.less")
    ));
}

#[test]
fn test_transform_errors_are_collected_per_node() {
    let project = Project::new(&[
        ("main.js", "import a from './a.json';\nimport b from './b.json';\nimport './ok.js';\n"),
        ("a.json", "{ not json"),
        ("b.json", "[1,"),
        ("ok.js", "export const ok = true;\n"),
    ]);
    let mut bundler = project.bundler(Mode::Development);
    let outcome = bundler.build();

    let failed: Vec<(&Path, &str)> = outcome
        .errors
        .iter()
        .map(|e| match e {
            BuildError::Transform(t) => (t.path.as_path(), t.step.as_str()),
            other => panic!("unexpected error: {other}"),
        })
        .collect();
    assert_eq!(
        failed,
        vec![
            (project.root.join("a.json").as_path(), "json"),
            (project.root.join("b.json").as_path(), "json"),
        ]
    );
    assert!(outcome.artifacts.is_empty());
    let ok = bundler.graphs()[0].get(&project.root.join("ok.js")).unwrap();
    assert!(ok.output.is_some());
}

#[test]
fn test_persisted_cache_serves_a_new_context() {
    let project = add_project();
    let cache_dir = project.root.join(".weave-cache");
    let config = || BuildConfig::new(&project.root, Mode::Development).with_cache_dir(&cache_dir);

    let first = Bundler::new(BuildContext::init(config()).unwrap()).build();
    assert!(first.is_success());

    let second = Bundler::new(BuildContext::init(config()).unwrap()).build();
    assert!(second.is_success());
    assert_eq!(second.report.cache.computed, 0);
    assert_eq!(second.report.cache.disk_hits, 3);
    assert_eq!(first.artifacts, second.artifacts);
}

#[test]
fn test_html_page_references_artifacts() {
    let project = add_project();
    let template = project.write("public/index.html", "<!doctype html><html><head></head><body></body></html>");
    let mut config = project.config(Mode::Production);
    config.html = Some(weave_core::config::HtmlConfig {
        template,
        filename: "index.html".to_string(),
    });
    let outcome = Bundler::new(BuildContext::init(config).unwrap()).build();
    assert!(outcome.is_success(), "{:?}", outcome.errors);

    let page = outcome
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Html)
        .unwrap();
    let html = String::from_utf8_lossy(&page.bytes);
    assert!(html.contains("<link rel=\"stylesheet\" href=\"css/main.css\">"));
    assert!(html.contains("<script defer src=\"js/main.js\"></script>\n</head>"));
}

struct Counting(Arc<AtomicUsize>);

impl Transform for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn transform(
        &self,
        input: &[u8],
        _meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(50));
        Ok(TransformOutput::bytes(input))
    }
}

#[test]
fn test_concurrent_builds_transform_identical_content_once() {
    let project = Project::new(&[("main.js", "export default 1;\n")]);
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(IncrementalCache::new_in_memory());

    let contexts: Vec<Arc<BuildContext>> = (0..2)
        .map(|_| {
            let mut registry = Registry::new(&project.root, Mode::Development);
            registry
                .register(
                    Predicate::Extension("js".into()),
                    Chain::new(vec![Arc::new(Counting(Arc::clone(&calls)))]),
                )
                .unwrap();
            BuildContext::builder(project.config(Mode::Development))
                .registry(registry)
                .cache(Arc::clone(&cache))
                .init()
                .unwrap()
        })
        .collect();

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = contexts
            .iter()
            .map(|ctx| s.spawn(move || Bundler::new(Arc::clone(ctx)).build()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(outcomes.iter().all(weave_core::BuildOutcome::is_success));
    assert_eq!(outcomes[0].artifacts, outcomes[1].artifacts);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
