//! The runtime dependency bundler.
//!
//! For every dependency declared in the project manifest, the bundler
//! resolves the entry files from the dependency's own manifest, produces a
//! standalone minified bundle per entry, and copies the dependency's
//! manifest unchanged alongside, so the packaged distribution stays
//! introspectable. Modules in the exclusion set are never embedded; the
//! host runtime supplies them at load time.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{BundleError, UnresolvedEntry};
use crate::manifest::{MANIFEST_FILE, ProjectManifest, resolve_entries};

/// Modules assumed present in the host environment: platform built-ins
/// plus the APIs the host shell provides to both process sides.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // platform built-ins
    "assert",
    "buffer",
    "console",
    "constants",
    "crypto",
    "domain",
    "events",
    "http",
    "https",
    "os",
    "path",
    "punycode",
    "querystring",
    "stream",
    "string_decoder",
    "timers",
    "tty",
    "url",
    "util",
    "vm",
    "zlib",
    // host-provided APIs
    "app",
    "auto-updater",
    "browser-window",
    "content-tracing",
    "dialog",
    "global-shortcut",
    "ipc",
    "menu",
    "menu-item",
    "power-monitor",
    "protocol",
    "tray",
    "remote",
    "web-frame",
    "clipboard",
    "crash-reporter",
    "native-image",
    "screen",
    "shell",
];

/// Produces one self-contained bundle for an entry file, with the given
/// standalone global name, leaving excluded modules as external
/// references.
pub trait Bundler: Send + Sync {
    fn bundle(
        &self,
        entry: &Utf8Path,
        global_name: &str,
        exclude: &[String],
    ) -> anyhow::Result<Vec<u8>>;
}

/// Real bundler wrapping the external `esbuild` binary.
pub struct EsbuildBundler;

impl Bundler for EsbuildBundler {
    fn bundle(
        &self,
        entry: &Utf8Path,
        global_name: &str,
        exclude: &[String],
    ) -> anyhow::Result<Vec<u8>> {
        let mut args = vec![
            "--bundle".to_string(),
            "--minify".to_string(),
            "--format=iife".to_string(),
            format!("--global-name={global_name}"),
        ];
        for module in exclude {
            args.push(format!("--external:{module}"));
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        crate::transform::esbuild(entry, &args)
    }
}

/// Where the bundler reads from and writes to, and which modules it must
/// never embed.
pub struct BundleSpec {
    /// Dependency module tree, keyed by dependency name.
    pub modules_dir: Utf8PathBuf,
    /// Output tree; each dependency lands under its own subdirectory.
    pub out_dir: Utf8PathBuf,
    /// The exclusion set, applied identically to every bundle.
    pub exclude: Vec<String>,
}

impl BundleSpec {
    pub fn new(modules_dir: Utf8PathBuf, out_dir: Utf8PathBuf) -> Self {
        Self {
            modules_dir,
            out_dir,
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The standalone global name for an entry file: its base name without
/// extension, with non-identifier characters replaced so the bundler
/// accepts it.
pub fn global_name(entry: &Utf8Path) -> String {
    let stem = entry.file_stem().unwrap_or(entry.as_str());
    stem.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Bundle every declared dependency. Output is fully determined by the
/// dependency list, the exclusion set and each dependency's own files;
/// the first unresolvable entry aborts the whole phase so packaging never
/// sees a partial dependency set. Returns the number of bundles written.
pub fn bundle_dependencies(
    manifest: &ProjectManifest,
    spec: &BundleSpec,
    bundler: &dyn Bundler,
) -> Result<usize, BundleError> {
    let mut bundled = 0;

    for (name, version) in manifest.dependencies() {
        let dep_root = spec.modules_dir.join(&name);
        let manifest_path = dep_root.join(MANIFEST_FILE);

        let manifest_text = fs::read_to_string(&manifest_path).map_err(|source| {
            BundleError::DependencyManifest {
                dependency: name.clone(),
                source: source.into(),
            }
        })?;
        let entries =
            resolve_entries(&manifest_text).map_err(|source| BundleError::DependencyManifest {
                dependency: name.clone(),
                source: source.into(),
            })?;

        tracing::debug!("bundling {name}@{version}: {} entries", entries.len());
        let out_dep = spec.out_dir.join(&name);

        for entry in entries {
            let entry_path = dep_root.join(&entry);
            if !entry_path.is_file() {
                return Err(UnresolvedEntry {
                    dependency: name,
                    entry: entry_path,
                }
                .into());
            }

            let data = bundler
                .bundle(&entry_path, &global_name(&entry), &spec.exclude)
                .map_err(|source| BundleError::Tool {
                    dependency: name.clone(),
                    entry: entry_path.clone(),
                    source,
                })?;

            let base = entry.file_name().unwrap_or(entry.as_str());
            crate::io::write_atomic(&out_dep.join(base), &data)?;
            bundled += 1;
        }

        // The dependency's own manifest travels with its bundles.
        crate::io::write_atomic(&out_dep.join(MANIFEST_FILE), manifest_text.as_bytes())?;
    }

    Ok(bundled)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    /// Records every invocation and produces deterministic marker output.
    struct FakeBundler {
        calls: Mutex<Vec<(Utf8PathBuf, String, Vec<String>)>>,
    }

    impl FakeBundler {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Bundler for FakeBundler {
        fn bundle(
            &self,
            entry: &Utf8Path,
            global_name: &str,
            exclude: &[String],
        ) -> anyhow::Result<Vec<u8>> {
            self.calls.lock().unwrap().push((
                entry.to_owned(),
                global_name.to_string(),
                exclude.to_vec(),
            ));
            Ok(format!("bundle({global_name})").into_bytes())
        }
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        (dir, path)
    }

    fn write_dep(modules: &Utf8Path, name: &str, manifest: &str, files: &[&str]) {
        let root = modules.join(name);
        for file in files {
            let path = root.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            std::fs::write(&path, "module.exports = 1;").expect("write");
        }
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join(MANIFEST_FILE), manifest).expect("write");
    }

    fn project(deps: serde_json::Value) -> ProjectManifest {
        ProjectManifest::from_value(json!({ "name": "shell", "dependencies": deps }))
    }

    #[test]
    fn bundles_the_declared_main_under_its_base_name() {
        let (_guard, root) = tempdir();
        let modules = root.join("node_modules");
        write_dep(
            &modules,
            "widgets",
            r#"{ "main": "lib/foo.js" }"#,
            &["lib/foo.js"],
        );

        let spec = BundleSpec::new(modules, root.join("dist/node_modules"));
        let bundler = FakeBundler::new();
        let count = bundle_dependencies(&project(json!({ "widgets": "1.0.0" })), &spec, &bundler)
            .expect("bundles");

        assert_eq!(count, 1);
        let out = root.join("dist/node_modules/widgets/foo.js");
        assert_eq!(std::fs::read_to_string(out).unwrap(), "bundle(foo)");
    }

    #[test]
    fn missing_main_falls_back_to_the_default_entry() {
        let (_guard, root) = tempdir();
        let modules = root.join("node_modules");
        write_dep(&modules, "plain", r#"{ "name": "plain" }"#, &["index.js"]);

        let spec = BundleSpec::new(modules, root.join("dist/node_modules"));
        let bundler = FakeBundler::new();
        bundle_dependencies(&project(json!({ "plain": "0.1.0" })), &spec, &bundler)
            .expect("bundles");

        assert!(root.join("dist/node_modules/plain/index.js").is_file());
    }

    #[test]
    fn main_list_produces_one_bundle_per_entry_in_order() {
        let (_guard, root) = tempdir();
        let modules = root.join("node_modules");
        write_dep(
            &modules,
            "multi",
            r#"{ "main": ["lib/second.js", "lib/first.js"] }"#,
            &["lib/second.js", "lib/first.js"],
        );

        let spec = BundleSpec::new(modules.clone(), root.join("dist/node_modules"));
        let bundler = FakeBundler::new();
        bundle_dependencies(&project(json!({ "multi": "1.0.0" })), &spec, &bundler)
            .expect("bundles");

        let calls = bundler.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // Declared order is preserved, each named by its own base name.
        assert_eq!(calls[0].0, modules.join("multi/lib/second.js"));
        assert_eq!(calls[0].1, "second");
        assert_eq!(calls[1].0, modules.join("multi/lib/first.js"));
        assert_eq!(calls[1].1, "first");
    }

    #[test]
    fn exclusion_set_reaches_every_bundle_invocation() {
        let (_guard, root) = tempdir();
        let modules = root.join("node_modules");
        write_dep(&modules, "a", r#"{ "main": "index.js" }"#, &["index.js"]);
        write_dep(&modules, "b", r#"{ "main": "index.js" }"#, &["index.js"]);

        let mut spec = BundleSpec::new(modules, root.join("dist/node_modules"));
        spec.exclude = vec!["http".to_string(), "crypto".to_string()];

        let bundler = FakeBundler::new();
        bundle_dependencies(
            &project(json!({ "a": "1.0.0", "b": "1.0.0" })),
            &spec,
            &bundler,
        )
        .expect("bundles");

        let calls = bundler.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        for (_, _, exclude) in calls.iter() {
            assert_eq!(exclude, &["http".to_string(), "crypto".to_string()]);
        }
    }

    #[test]
    fn unresolvable_entry_aborts_with_the_dependency_name() {
        let (_guard, root) = tempdir();
        let modules = root.join("node_modules");
        // Manifest declares an entry that does not exist on disk.
        write_dep(&modules, "broken", r#"{ "main": "lib/gone.js" }"#, &[]);

        let spec = BundleSpec::new(modules, root.join("dist/node_modules"));
        let bundler = FakeBundler::new();
        let err = bundle_dependencies(&project(json!({ "broken": "1.0.0" })), &spec, &bundler)
            .expect_err("fails");

        match err {
            BundleError::Unresolved(unresolved) => {
                assert_eq!(unresolved.dependency, "broken");
                assert_eq!(unresolved.entry.file_name(), Some("gone.js"));
            }
            other => panic!("expected UnresolvedEntry, got {other:?}"),
        }
    }

    #[test]
    fn dependency_manifest_is_copied_unchanged() {
        let (_guard, root) = tempdir();
        let modules = root.join("node_modules");
        let manifest = r#"{ "name": "widgets", "main": "index.js", "license": "MIT" }"#;
        write_dep(&modules, "widgets", manifest, &["index.js"]);

        let spec = BundleSpec::new(modules, root.join("dist/node_modules"));
        let bundler = FakeBundler::new();
        bundle_dependencies(&project(json!({ "widgets": "1.0.0" })), &spec, &bundler)
            .expect("bundles");

        let copied = root.join("dist/node_modules/widgets").join(MANIFEST_FILE);
        assert_eq!(std::fs::read_to_string(copied).unwrap(), manifest);
    }

    #[test]
    fn global_name_sanitizes_the_entry_stem() {
        assert_eq!(global_name(Utf8Path::new("polyfill.js")), "polyfill");
        assert_eq!(global_name(Utf8Path::new("lib/foo-bar.js")), "foo_bar");
    }
}
