//! Wiring of the named build steps onto the task graph, plus the
//! operations exposed to the command surface: full build, clean,
//! packaging and the watch session.
//!
//! Inputs come from the conventional source tree, outputs land in two
//! mirrored trees: the staging directory (watch-friendly, debuggable)
//! and the distribution directory (release-ready, minified). External
//! tools are injected through [`Tools`], so the whole wiring runs against
//! fakes in tests.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::bundle::{BundleSpec, Bundler, EsbuildBundler, bundle_dependencies};
use crate::error::{ConfigError, KarakuriError};
use crate::graph::{Blueprint, TaskGraph};
use crate::html;
use crate::manifest::{MANIFEST_FILE, ProjectManifest};
use crate::package::{Packager, ShellPackager, package_all};
use crate::transform::{PassThrough, ScriptCompiler, StyleCompiler, Transform, TransformStep};
use crate::{Environment, Mode};

const SRC_DIR: &str = "src";
const STAGING_DIR: &str = ".serve";
const DIST_DIR: &str = "dist";
const RELEASE_DIR: &str = "release";
const MODULES_DIR: &str = "node_modules";

/// Directory layout of one project. Every step receives its inputs and
/// outputs from here; nothing reads implicit global paths, which is what
/// lets the whole pipeline run inside a temporary directory in tests.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: Utf8PathBuf,
    pub src: Utf8PathBuf,
    pub staging: Utf8PathBuf,
    pub dist: Utf8PathBuf,
    pub release: Utf8PathBuf,
    pub modules: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        Self {
            src: root.join(SRC_DIR),
            staging: root.join(STAGING_DIR),
            dist: root.join(DIST_DIR),
            release: root.join(RELEASE_DIR),
            modules: root.join(MODULES_DIR),
            root,
        }
    }

    /// Where transformed sources land: staging while watching, the
    /// distribution tree for a release build.
    fn out(&self, mode: Mode) -> &Utf8Path {
        match mode {
            Mode::Watch => &self.staging,
            Mode::Build => &self.dist,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Application display name for packaging; defaults to the manifest
    /// name.
    pub app_name: Option<String>,
    /// Target CPU architecture handed to the packager.
    pub arch: String,
    /// Enabled platform targets, one packaging invocation each.
    pub platforms: Vec<String>,
    /// Coalescing window for watch-mode change events.
    pub debounce: Duration,
    /// Program used to launch the managed application in watch mode.
    pub dev_program: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            app_name: None,
            arch: "x64".to_string(),
            platforms: vec!["darwin".to_string()],
            debounce: Duration::from_millis(250),
            dev_program: "electron".to_string(),
        }
    }
}

/// The external tools behind capability traits. The default set shells
/// out to the real compilers; tests substitute fakes.
pub struct Tools {
    pub scripts: Arc<dyn Transform>,
    pub styles: Arc<dyn Transform>,
    pub bundler: Arc<dyn Bundler>,
    pub packager: Arc<dyn Packager>,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            scripts: Arc::new(ScriptCompiler),
            styles: Arc::new(StyleCompiler),
            bundler: Arc::new(EsbuildBundler),
            packager: Arc::new(ShellPackager::default()),
        }
    }
}

pub struct Pipeline {
    layout: Layout,
    options: Options,
    manifest: ProjectManifest,
    packager: Arc<dyn Packager>,
    graph: TaskGraph,
}

impl Pipeline {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Result<Self, ConfigError> {
        Self::with_tools(Layout::new(root), Options::default(), Tools::default())
    }

    pub fn with_tools(
        layout: Layout,
        options: Options,
        tools: Tools,
    ) -> Result<Self, ConfigError> {
        let manifest = ProjectManifest::load(&layout.root.join(MANIFEST_FILE))?;
        let graph = build_graph(&layout, &manifest, &tools)?;

        Ok(Self {
            layout,
            options,
            manifest,
            packager: tools.packager,
            graph,
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Full non-watch pipeline into the distribution tree.
    pub fn build(&self) -> Result<(), KarakuriError> {
        let env = Environment { mode: Mode::Build };
        self.graph.run("build", &env)?;
        Ok(())
    }

    /// Run one named task (and its prerequisites) in the given mode.
    pub fn run_task(&self, id: &str, mode: Mode) -> Result<(), KarakuriError> {
        self.graph.run(id, &Environment { mode })?;
        Ok(())
    }

    /// Populate the staging tree the watch session serves from.
    pub fn stage(&self) -> Result<(), KarakuriError> {
        let env = Environment { mode: Mode::Watch };
        self.graph.run_many(
            &["inject-css", "compile-scripts", "compile-styles", "copy-assets"],
            &env,
        )?;
        Ok(())
    }

    /// Remove every generated directory. A following build starts from
    /// nothing.
    pub fn clean(&self) -> Result<(), KarakuriError> {
        crate::io::remove_dirs([
            self.layout.staging.as_path(),
            self.layout.dist.as_path(),
            self.layout.release.as_path(),
        ])
        .map_err(KarakuriError::Clean)
    }

    /// Build, then invoke the packager once per enabled platform. One
    /// platform failing doesn't stop the others, but any failure fails
    /// the overall run.
    pub fn package(&self, platforms: Option<Vec<String>>) -> Result<(), KarakuriError> {
        self.build()?;

        let platforms = platforms.unwrap_or_else(|| self.options.platforms.clone());
        let name = self
            .options
            .app_name
            .as_deref()
            .or_else(|| self.manifest.name())
            .unwrap_or("app");
        let version = self.manifest.version().unwrap_or("0.0.0");

        let failures = package_all(
            &platforms,
            &self.layout.dist,
            &self.layout.release,
            name,
            &self.options.arch,
            version,
            self.packager.as_ref(),
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KarakuriError::Packaging(failures))
        }
    }

    /// Watch mode: staging build, managed process, live restart/reload.
    /// Blocks for the duration of the watch session.
    #[cfg(feature = "live")]
    pub fn serve(&self) -> Result<(), KarakuriError> {
        use notify::RecursiveMode;

        use crate::process::ShellProcess;
        use crate::serve::{ServeOptions, WatchTriggers, serve};

        self.stage()?;

        let triggers = WatchTriggers {
            restart: compile_patterns(&[
                format!("{STAGING_DIR}/app.js"),
                format!("{STAGING_DIR}/browser/**/*.js"),
            ]),
            reload: compile_patterns(&[
                format!("{STAGING_DIR}/styles/**/*.css"),
                format!("{STAGING_DIR}/renderer/**/*.html"),
                format!("{STAGING_DIR}/renderer/**/*.js"),
            ]),
        };

        let options = ServeOptions {
            debounce: self.options.debounce,
            roots: vec![
                (self.layout.src.clone(), RecursiveMode::Recursive),
                (self.layout.staging.clone(), RecursiveMode::Recursive),
                (
                    self.layout.root.join(MANIFEST_FILE),
                    RecursiveMode::NonRecursive,
                ),
            ],
        };

        let mut process = ShellProcess::new(self.options.dev_program.clone());
        serve(
            &self.graph,
            &self.layout.root,
            &self.layout.staging,
            &triggers,
            &mut process,
            &options,
        )?;

        Ok(())
    }

    /// Serve from the release-ready build: full build, then launch the
    /// managed process from the distribution tree and wait for it.
    #[cfg(feature = "live")]
    pub fn serve_dist(&self) -> Result<(), KarakuriError> {
        use crate::process::{AppProcess, ShellProcess};

        self.build()?;

        let mut process = ShellProcess::new(self.options.dev_program.clone());
        process.start(&self.layout.dist).map_err(KarakuriError::Watch)?;
        process.wait().map_err(KarakuriError::Watch)?;

        Ok(())
    }
}

#[cfg(feature = "live")]
fn compile_patterns(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .map(|p| glob::Pattern::new(p).expect("invalid trigger pattern"))
        .collect()
}

fn compress_css(css: &str) -> anyhow::Result<String> {
    let options = grass::Options::default().style(grass::OutputStyle::Compressed);
    grass::from_string(css.to_string(), &options).map_err(|e| anyhow::anyhow!("{e}"))
}

fn build_graph(
    layout: &Layout,
    manifest: &ProjectManifest,
    tools: &Tools,
) -> Result<TaskGraph, ConfigError> {
    let mut blueprint = Blueprint::new();

    // compile-scripts: transpile everything under src/, preserving
    // structure. Watch output goes to staging with source maps, release
    // output minified into the distribution tree.
    {
        let l = layout.clone();
        let tool = tools.scripts.clone();
        blueprint = blueprint.add_watched_task(
            "compile-scripts",
            &[],
            &["src/**/*.js", "src/**/*.jsx"],
            move |env| {
                let out = l.out(env.mode);
                for ext in ["js", "jsx"] {
                    TransformStep::new(l.src.clone(), format!("{}/**/*.{ext}", l.src), tool.clone())
                        .rename_ext("js")
                        .run(out, env.mode)?;
                }
                Ok(())
            },
        );
    }

    // compile-styles: stylesheets land in the staging tree, where both
    // the injection and the distribution concatenation pick them up.
    // Partials (leading underscore) only exist through their importers.
    {
        let l = layout.clone();
        let tool = tools.styles.clone();
        blueprint = blueprint.add_watched_task(
            "compile-styles",
            &[],
            &["src/styles/**/*.scss"],
            move |env| {
                let styles = l.src.join("styles");
                TransformStep::new(styles.clone(), format!("{styles}/**/[!_]*.scss"), tool.clone())
                    .rename_ext("css")
                    .run(&l.staging.join("styles"), env.mode)?;
                Ok(())
            },
        );
    }

    // inject-css: rewrite the marker region of every source HTML file
    // with links to the compiled stylesheets, into the staging tree.
    {
        let l = layout.clone();
        blueprint = blueprint.add_watched_task(
            "inject-css",
            &["compile-styles"],
            &[MANIFEST_FILE, "src/renderer/index.html"],
            move |_| {
                let css_root = l.staging.join("styles");
                let mut sheets = Vec::new();
                for entry in glob::glob(&format!("{css_root}/**/*.css"))? {
                    let path = Utf8PathBuf::try_from(entry?)?;
                    sheets.push(path.strip_prefix(&css_root).unwrap_or(&path).to_owned());
                }
                sheets.sort();

                for entry in glob::glob(&format!("{}/**/*.html", l.src))? {
                    let path = Utf8PathBuf::try_from(entry?)?;
                    let rel = path.strip_prefix(&l.src).unwrap_or(&path).to_owned();
                    let prefix = html::ascend_prefix(&rel);

                    let hrefs: Vec<String> = sheets
                        .iter()
                        .map(|sheet| format!("{prefix}styles/{sheet}"))
                        .collect();

                    let text = fs::read_to_string(&path)?;
                    let injected = html::inject_stylesheets(&text, &hrefs);
                    crate::io::write_atomic(&l.staging.join(rel), injected.as_bytes())?;
                }

                Ok(())
            },
        );
    }

    // build-html: collapse build blocks of the staged renderer markup
    // into single links, concatenating and minifying the referenced
    // stylesheets, and mirror the compiled stylesheets into the
    // distribution tree.
    {
        let l = layout.clone();
        blueprint = blueprint.add_task("build-html", &["inject-css"], move |env| {
            let css_root = l.staging.join("styles");
            for entry in glob::glob(&format!("{css_root}/**/*.css"))? {
                let path = Utf8PathBuf::try_from(entry?)?;
                let rel = path.strip_prefix(&css_root).unwrap_or(&path).to_owned();
                let text = fs::read_to_string(&path)?;
                let text = match env.mode {
                    Mode::Build => compress_css(&text)?,
                    Mode::Watch => text,
                };
                crate::io::write_atomic(&l.dist.join("styles").join(rel), text.as_bytes())?;
            }

            let roots = vec![l.staging.join("styles"), l.modules.clone()];
            for entry in glob::glob(&format!("{}/renderer/**/*.html", l.staging))? {
                let path = Utf8PathBuf::try_from(entry?)?;
                let rel = path.strip_prefix(&l.staging).unwrap_or(&path).to_owned();

                let text = fs::read_to_string(&path)?;
                let prefix = html::ascend_prefix(&rel);
                let (rewritten, bundles) = html::concat_build_blocks(&text, &prefix, &mut |href| {
                    html::resolve_href(href, &roots)
                })?;

                for (target, css) in bundles {
                    let css = match env.mode {
                        Mode::Build => compress_css(&css)?,
                        Mode::Watch => css,
                    };
                    crate::io::write_atomic(&l.dist.join(target), css.as_bytes())?;
                }

                crate::io::write_atomic(&l.dist.join(rel), rewritten.as_bytes())?;
            }

            Ok(())
        });
    }

    // copy-assets: staging always, distribution on release builds.
    {
        let l = layout.clone();
        blueprint = blueprint.add_watched_task(
            "copy-assets",
            &[],
            &["src/assets/**/*"],
            move |env| {
                let assets = l.src.join("assets");
                crate::io::copy_tree(&assets, &l.staging.join("assets"))?;
                if let Mode::Build = env.mode {
                    crate::io::copy_tree(&assets, &l.dist.join("assets"))?;
                }
                Ok(())
            },
        );
    }

    // copy-fonts: dependency-provided fonts, flattened.
    {
        let l = layout.clone();
        blueprint = blueprint.add_task("copy-fonts", &[], move |env| {
            TransformStep::new(
                l.modules.clone(),
                format!("{}/**/fonts/*.woff", l.modules),
                Arc::new(PassThrough),
            )
            .flatten()
            .run(&l.dist.join("fonts"), env.mode)?;
            Ok(())
        });
    }

    // bundle-deps: one standalone bundle per dependency entry, manifests
    // copied alongside.
    {
        let l = layout.clone();
        let m = manifest.clone();
        let bundler = tools.bundler.clone();
        blueprint = blueprint.add_task("bundle-deps", &[], move |_| {
            let spec = BundleSpec::new(l.modules.clone(), l.dist.join(MODULES_DIR));
            bundle_dependencies(&m, &spec, bundler.as_ref())?;
            Ok(())
        });
    }

    // write-manifest: the distribution manifest with the entry point
    // overridden, once the bundles it describes exist.
    {
        let l = layout.clone();
        let m = manifest.clone();
        blueprint = blueprint.add_task("write-manifest", &["bundle-deps"], move |_| {
            m.write_distribution(&l.dist)?;
            Ok(())
        });
    }

    blueprint
        .add_task(
            "build",
            &[
                "build-html",
                "compile-scripts",
                "write-manifest",
                "copy-fonts",
                "copy-assets",
            ],
            |_| Ok(()),
        )
        .seal()
}
