//! Platform packaging: one external packager invocation per enabled
//! target, each writing an independent output directory under the release
//! root. Invocations share no mutable state, so one platform failing never
//! prevents another from being attempted.

use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PackagingError;

/// Everything one packaging invocation needs.
#[derive(Debug, Clone)]
pub struct PackageRequest {
    /// Distribution staging root to package.
    pub source: Utf8PathBuf,
    /// Output directory for this platform's artifact.
    pub out: Utf8PathBuf,
    /// Application display name.
    pub name: String,
    /// Target CPU architecture.
    pub arch: String,
    /// Target platform identifier.
    pub platform: String,
    /// Application version string.
    pub version: String,
}

/// External packaging tool, invoked as a black box.
pub trait Packager: Send + Sync {
    fn package(&self, request: &PackageRequest) -> anyhow::Result<()>;
}

/// Real packager shelling out to an `electron-packager` compatible tool.
pub struct ShellPackager {
    pub program: String,
}

impl Default for ShellPackager {
    fn default() -> Self {
        Self {
            program: "electron-packager".to_string(),
        }
    }
}

impl Packager for ShellPackager {
    fn package(&self, request: &PackageRequest) -> anyhow::Result<()> {
        let output = Command::new(&self.program)
            .arg(request.source.as_str())
            .arg(&request.name)
            .arg(format!("--out={}", request.out))
            .arg(format!("--arch={}", request.arch))
            .arg(format!("--platform={}", request.platform))
            .arg(format!("--app-version={}", request.version))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}\n{}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        Ok(())
    }
}

/// Package the distribution for every enabled platform. Each platform gets
/// its own directory under `release_root`; failures are collected rather
/// than short-circuiting, so a working platform still produces its
/// artifact next to a broken one. The returned list is empty on full
/// success.
pub fn package_all(
    platforms: &[String],
    source: &Utf8Path,
    release_root: &Utf8Path,
    name: &str,
    arch: &str,
    version: &str,
    packager: &dyn Packager,
) -> Vec<PackagingError> {
    let mut failures = Vec::new();

    for platform in platforms {
        let request = PackageRequest {
            source: source.to_owned(),
            out: release_root.join(platform),
            name: name.to_string(),
            arch: arch.to_string(),
            platform: platform.clone(),
            version: version.to_string(),
        };

        tracing::info!("packaging for {platform} into {}", request.out);

        if let Err(e) = std::fs::create_dir_all(&request.out) {
            failures.push(PackagingError {
                platform: platform.clone(),
                diagnostics: e.to_string(),
            });
            continue;
        }

        match packager.package(&request) {
            Ok(()) => tracing::info!("packaged {platform}"),
            Err(e) => {
                tracing::error!("packaging {platform} failed: {e:#}");
                failures.push(PackagingError {
                    platform: platform.clone(),
                    diagnostics: format!("{e:#}"),
                });
            }
        }
    }

    failures
}
