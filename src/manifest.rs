//! The project manifest and its derived distribution manifest.
//!
//! The manifest is kept as a raw [`serde_json::Value`] so that free-form
//! fields survive the round trip into the packaged output; only the handful
//! of fields the pipeline cares about are read through typed accessors.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;

/// Conventional manifest file name, both for the project and for each
/// dependency in the module tree.
pub const MANIFEST_FILE: &str = "package.json";

/// Entry file assumed when a dependency's manifest declares no main.
pub const DEFAULT_ENTRY: &str = "index.js";

/// The entry point written into the distribution manifest, overriding
/// whatever the project manifest declares.
pub const DIST_ENTRY: &str = "app.js";

#[derive(Debug, Clone)]
pub struct ProjectManifest {
    raw: Value,
}

impl ProjectManifest {
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ManifestRead {
            path: path.to_owned(),
            source,
        })?;
        let raw = serde_json::from_str(&text).map_err(|source| ConfigError::ManifestParse {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self { raw })
    }

    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    pub fn name(&self) -> Option<&str> {
        self.raw.get("name").and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        self.raw.get("version").and_then(Value::as_str)
    }

    /// Declared runtime dependencies as a name to version map. The version
    /// is informational only; entry files come from each dependency's own
    /// manifest. Sorted, so bundling order is deterministic.
    pub fn dependencies(&self) -> BTreeMap<String, String> {
        let Some(Value::Object(deps)) = self.raw.get("dependencies") else {
            return BTreeMap::new();
        };

        deps.iter()
            .filter_map(|(name, version)| {
                version
                    .as_str()
                    .map(|version| (name.clone(), version.to_string()))
            })
            .collect()
    }

    /// The manifest for the packaged output: identical to the project's own
    /// manifest except the entry point is overridden to [`DIST_ENTRY`].
    /// Pure; the project manifest itself is left untouched.
    pub fn for_distribution(&self) -> Value {
        let mut dist = self.raw.clone();
        if let Value::Object(map) = &mut dist {
            map.insert("main".to_string(), Value::String(DIST_ENTRY.to_string()));
        }
        dist
    }

    /// Write the distribution manifest into the distribution root.
    pub fn write_distribution(&self, dist_root: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
        let path = dist_root.join(MANIFEST_FILE);
        let json = serde_json::to_vec(&self.for_distribution())?;
        crate::io::write_atomic(&path, &json)?;
        Ok(path)
    }
}

#[derive(Debug, Deserialize)]
struct DependencyManifest {
    main: Option<MainField>,
}

/// A dependency manifest's main-file declaration: a single path, an
/// ordered list of paths, or absent entirely.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MainField {
    One(String),
    Many(Vec<String>),
}

/// Resolve the entry files declared by a dependency's own manifest text,
/// in declared order. An absent main yields the conventional default.
pub fn resolve_entries(manifest_text: &str) -> Result<Vec<Utf8PathBuf>, serde_json::Error> {
    let parsed: DependencyManifest = serde_json::from_str(manifest_text)?;

    Ok(match parsed.main {
        None => vec![Utf8PathBuf::from(DEFAULT_ENTRY)],
        Some(MainField::One(main)) => vec![Utf8PathBuf::from(main)],
        Some(MainField::Many(mains)) => mains.into_iter().map(Utf8PathBuf::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolves_a_single_declared_main() {
        let entries = resolve_entries(r#"{ "main": "lib/foo.js" }"#).expect("parses");
        assert_eq!(entries, vec![Utf8PathBuf::from("lib/foo.js")]);
        assert_eq!(entries[0].file_name(), Some("foo.js"));
    }

    #[test]
    fn resolves_the_default_when_main_is_absent() {
        let entries = resolve_entries(r#"{ "name": "plain" }"#).expect("parses");
        assert_eq!(entries, vec![Utf8PathBuf::from(DEFAULT_ENTRY)]);
    }

    #[test]
    fn resolves_a_main_list_in_declared_order() {
        let entries =
            resolve_entries(r#"{ "main": ["lib/b.js", "lib/a.js"] }"#).expect("parses");
        assert_eq!(
            entries,
            vec![Utf8PathBuf::from("lib/b.js"), Utf8PathBuf::from("lib/a.js")]
        );
    }

    #[test]
    fn dependencies_are_sorted_by_name() {
        let manifest = ProjectManifest::from_value(json!({
            "dependencies": { "zeta": "1.0.0", "alpha": "2.0.0" }
        }));

        let deps: Vec<_> = manifest.dependencies().into_iter().collect();
        assert_eq!(
            deps,
            vec![
                ("alpha".to_string(), "2.0.0".to_string()),
                ("zeta".to_string(), "1.0.0".to_string()),
            ]
        );
    }

    #[test]
    fn distribution_manifest_overrides_only_the_entry_point() {
        let manifest = ProjectManifest::from_value(json!({
            "name": "shell",
            "version": "0.1.0",
            "main": "lib/dev-entry.js",
            "author": { "name": "someone" },
            "dependencies": { "alpha": "2.0.0" }
        }));

        let dist = manifest.for_distribution();

        assert_eq!(dist["main"], json!(DIST_ENTRY));
        assert_eq!(dist["name"], json!("shell"));
        // Free-form fields pass through untouched.
        assert_eq!(dist["author"], json!({ "name": "someone" }));
        assert_eq!(dist["dependencies"], json!({ "alpha": "2.0.0" }));

        // Pure: deriving twice yields the same value, source unchanged.
        assert_eq!(dist, manifest.for_distribution());
        assert_eq!(manifest.raw["main"], json!("lib/dev-entry.js"));
    }
}
