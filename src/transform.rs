//! Asset transform steps.
//!
//! Every step reads a glob-matched input set, pushes each file through a
//! single [`Transform`], and writes the result into an output root,
//! preserving relative directory structure unless the step explicitly
//! flattens it. Transforms are capability objects so the pipeline can be
//! exercised in tests without invoking real compilers.
//!
//! Steps are idempotent and atomic: re-running on unchanged input produces
//! byte-identical output (and leaves the file untouched on disk), and an
//! output file is only ever visible in its complete form.

use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{ParallelBridge, ParallelIterator};

use crate::Mode;
use crate::error::TransformError;

/// A single file transform. In `Watch` mode the transform keeps output
/// debuggable and emits position-mapping metadata where the underlying
/// tool supports it; in `Build` mode it minifies instead.
pub trait Transform: Send + Sync {
    fn apply(&self, source: &Utf8Path, mode: Mode) -> anyhow::Result<Vec<u8>>;
}

/// Script transpiler and minifier, wrapping the external `esbuild` binary.
pub struct ScriptCompiler;

impl Transform for ScriptCompiler {
    fn apply(&self, source: &Utf8Path, mode: Mode) -> anyhow::Result<Vec<u8>> {
        let args: &[&str] = match mode {
            // Inline source maps keep transformed output traceable back to
            // the original lines while editing.
            Mode::Watch => &["--sourcemap=inline"],
            Mode::Build => &["--minify"],
        };
        esbuild(source, args)
    }
}

/// Stylesheet compiler, running `grass` in process. Watch mode emits
/// expanded CSS, build mode compressed.
pub struct StyleCompiler;

impl Transform for StyleCompiler {
    fn apply(&self, source: &Utf8Path, mode: Mode) -> anyhow::Result<Vec<u8>> {
        let style = match mode {
            Mode::Watch => grass::OutputStyle::Expanded,
            Mode::Build => grass::OutputStyle::Compressed,
        };

        let options = grass::Options::default().style(style);
        let css = grass::from_path(source, &options)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("compiling {source}"))?;

        Ok(css.into_bytes())
    }
}

/// Identity transform for plain file copies (fonts, misc assets) that still
/// want the step machinery: globs, flattening, atomic writes.
pub struct PassThrough;

impl Transform for PassThrough {
    fn apply(&self, source: &Utf8Path, _: Mode) -> anyhow::Result<Vec<u8>> {
        std::fs::read(source).with_context(|| format!("reading {source}"))
    }
}

pub(crate) fn esbuild(file: &Utf8Path, args: &[&str]) -> anyhow::Result<Vec<u8>> {
    let output = Command::new("esbuild")
        .arg(file.as_str())
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("esbuild invocation failed")?;

    if !output.status.success() {
        anyhow::bail!(
            "esbuild exited with {}\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }

    Ok(output.stdout)
}

/// One transform step: a glob-matched input set pushed through a transform
/// into an output root.
pub struct TransformStep {
    /// Input root stripped from matches to obtain relative output paths.
    base: Utf8PathBuf,
    /// Glob pattern selecting the input files, rooted like `base`.
    pattern: String,
    /// Extension rewrite for outputs, e.g. `scss` inputs landing as `css`.
    out_ext: Option<&'static str>,
    /// Drop directory structure and emit all outputs directly into the
    /// output root.
    flatten: bool,
    tool: Arc<dyn Transform>,
}

impl TransformStep {
    pub fn new(
        base: impl Into<Utf8PathBuf>,
        pattern: impl Into<String>,
        tool: Arc<dyn Transform>,
    ) -> Self {
        Self {
            base: base.into(),
            pattern: pattern.into(),
            out_ext: None,
            flatten: false,
            tool,
        }
    }

    pub fn rename_ext(mut self, ext: &'static str) -> Self {
        self.out_ext = Some(ext);
        self
    }

    pub fn flatten(mut self) -> Self {
        self.flatten = true;
        self
    }

    /// Transform every matched input into `out_root`. Returns the number of
    /// files processed. Inputs are processed in parallel; the first error
    /// aborts the step.
    pub fn run(&self, out_root: &Utf8Path, mode: Mode) -> Result<usize, TransformError> {
        let matches = glob::glob(&self.pattern)?;

        let outputs = matches
            .par_bridge()
            .map(|entry| -> Result<(), TransformError> {
                let path = Utf8PathBuf::try_from(entry?)?;

                let data =
                    self.tool
                        .apply(&path, mode)
                        .map_err(|source| TransformError::Tool {
                            path: path.clone(),
                            source,
                        })?;

                let rel = if self.flatten {
                    Utf8PathBuf::from(path.file_name().unwrap_or(path.as_str()))
                } else {
                    path.strip_prefix(&self.base).unwrap_or(&path).to_owned()
                };

                let mut out = out_root.join(rel);
                if let Some(ext) = self.out_ext {
                    out.set_extension(ext);
                }

                crate::io::write_atomic(&out, &data).map_err(|source| TransformError::Write {
                    path: out.clone(),
                    source,
                })?;

                Ok(())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(outputs.len())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Uppercase;

    impl Transform for Uppercase {
        fn apply(&self, source: &Utf8Path, _: Mode) -> anyhow::Result<Vec<u8>> {
            let text = fs::read_to_string(source)?;
            Ok(text.to_uppercase().into_bytes())
        }
    }

    struct Failing;

    impl Transform for Failing {
        fn apply(&self, _: &Utf8Path, _: Mode) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("malformed input")
        }
    }

    struct CountingCopy(AtomicUsize);

    impl Transform for CountingCopy {
        fn apply(&self, source: &Utf8Path, _: Mode) -> anyhow::Result<Vec<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(fs::read(source)?)
        }
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        (dir, path)
    }

    #[test]
    fn preserves_relative_directory_structure() {
        let (_guard, root) = tempdir();
        let src = root.join("src");
        fs::create_dir_all(src.join("renderer/components")).expect("mkdir");
        fs::write(src.join("app.js"), "a").expect("write");
        fs::write(src.join("renderer/components/main.js"), "b").expect("write");

        let step = TransformStep::new(
            src.clone(),
            format!("{src}/**/*.js"),
            Arc::new(Uppercase),
        );

        let out = root.join("out");
        let count = step.run(&out, Mode::Build).expect("step runs");

        assert_eq!(count, 2);
        assert_eq!(fs::read_to_string(out.join("app.js")).unwrap(), "A");
        assert_eq!(
            fs::read_to_string(out.join("renderer/components/main.js")).unwrap(),
            "B"
        );
    }

    #[test]
    fn flatten_drops_directory_depth() {
        let (_guard, root) = tempdir();
        let src = root.join("modules");
        fs::create_dir_all(src.join("ui-kit/fonts")).expect("mkdir");
        fs::write(src.join("ui-kit/fonts/icons.woff"), "woff").expect("write");

        let step = TransformStep::new(
            src.clone(),
            format!("{src}/**/fonts/*.woff"),
            Arc::new(PassThrough),
        )
        .flatten();

        let out = root.join("fonts");
        step.run(&out, Mode::Build).expect("step runs");

        assert_eq!(fs::read_to_string(out.join("icons.woff")).unwrap(), "woff");
        assert!(!out.join("ui-kit").exists());
    }

    #[test]
    fn rewrites_output_extension() {
        let (_guard, root) = tempdir();
        let src = root.join("styles");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("app.scss"), "x").expect("write");

        let step = TransformStep::new(
            src.clone(),
            format!("{src}/**/[!_]*.scss"),
            Arc::new(Uppercase),
        )
        .rename_ext("css");

        let out = root.join("out");
        step.run(&out, Mode::Build).expect("step runs");

        assert_eq!(fs::read_to_string(out.join("app.css")).unwrap(), "X");
        assert!(!out.join("app.scss").exists());
    }

    #[test]
    fn rerunning_on_unchanged_input_is_byte_identical() {
        let (_guard, root) = tempdir();
        let src = root.join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("app.js"), "let x = 1;").expect("write");

        let step = TransformStep::new(
            src.clone(),
            format!("{src}/**/*.js"),
            Arc::new(Uppercase),
        );

        let out = root.join("out");
        step.run(&out, Mode::Build).expect("first run");
        let first = fs::read(out.join("app.js")).expect("read");

        step.run(&out, Mode::Build).expect("second run");
        let second = fs::read(out.join("app.js")).expect("read");

        assert_eq!(first, second);
    }

    #[test]
    fn tool_failure_reports_the_originating_file() {
        let (_guard, root) = tempdir();
        let src = root.join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("bad.js"), "").expect("write");

        let step = TransformStep::new(src.clone(), format!("{src}/**/*.js"), Arc::new(Failing));

        let err = step.run(&root.join("out"), Mode::Build).expect_err("fails");
        match err {
            TransformError::Tool { path, .. } => {
                assert_eq!(path.file_name(), Some("bad.js"));
            }
            other => panic!("expected Tool error, got {other:?}"),
        }

        // No partial output appeared for the failed file.
        assert!(!root.join("out/bad.js").exists());
    }

    #[test]
    fn every_matched_input_reaches_the_tool() {
        let (_guard, root) = tempdir();
        let src = root.join("assets");
        fs::create_dir_all(src.join("img")).expect("mkdir");
        fs::write(src.join("a.bin"), "a").expect("write");
        fs::write(src.join("img/b.bin"), "b").expect("write");

        let tool = Arc::new(CountingCopy(AtomicUsize::new(0)));
        let step = TransformStep::new(src.clone(), format!("{src}/**/*.bin"), tool.clone());

        let count = step.run(&root.join("out"), Mode::Build).expect("runs");

        assert_eq!(count, 2);
        assert_eq!(tool.0.load(Ordering::SeqCst), 2);
    }
}
