//! HTML asset wiring: stylesheet injection for the staging build and
//! build-block concatenation for the distribution build.
//!
//! Injection rewrites the region between the `inject:css` markers with one
//! link per compiled stylesheet. Concatenation collapses a `build:css`
//! block (several links) into a single link, merging and compressing the
//! referenced stylesheets into one file. Both rewrites are pure functions
//! over the HTML text; the surrounding steps do the file I/O.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

pub const INJECT_START: &str = "<!-- inject:css -->";
pub const INJECT_END: &str = "<!-- endinject -->";

const BUILD_START: &str = "<!-- build:css ";
const BUILD_END: &str = "<!-- endbuild -->";

/// Replace the region between the injection markers with a link tag per
/// stylesheet href, keeping the markers and their indentation. HTML
/// without markers passes through unchanged.
pub fn inject_stylesheets(html: &str, hrefs: &[String]) -> String {
    let mut out = Vec::new();
    let mut lines = html.lines();

    while let Some(line) = lines.next() {
        out.push(line.to_string());

        if line.trim() == INJECT_START {
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();

            for href in hrefs {
                out.push(format!("{indent}<link rel=\"stylesheet\" href=\"{href}\">"));
            }

            // Drop the previously injected region up to the end marker.
            for line in lines.by_ref() {
                if line.trim() == INJECT_END {
                    out.push(line.to_string());
                    break;
                }
            }
        }
    }

    let mut text = out.join("\n");
    if html.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// One `build:css` block: the target file it collapses into and the hrefs
/// of the stylesheets it references, in document order.
#[derive(Debug, PartialEq, Eq)]
pub struct BuildBlock {
    pub target: Utf8PathBuf,
    pub refs: Vec<String>,
}

/// Rewrite every `build:css` block into a single link to its target,
/// resolving each referenced stylesheet through `resolve`. The target is
/// relative to the output root; `link_prefix` climbs from the document
/// back up to that root. Returns the rewritten HTML and the concatenated
/// contents per target, in document order.
pub fn concat_build_blocks<F>(
    html: &str,
    link_prefix: &str,
    resolve: &mut F,
) -> anyhow::Result<(String, Vec<(Utf8PathBuf, String)>)>
where
    F: FnMut(&str) -> anyhow::Result<String>,
{
    let mut out = Vec::new();
    let mut bundles = Vec::new();
    let mut lines = html.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();

        let Some(rest) = trimmed.strip_prefix(BUILD_START) else {
            out.push(line.to_string());
            continue;
        };
        let Some(target) = rest.strip_suffix("-->").map(str::trim) else {
            out.push(line.to_string());
            continue;
        };

        let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
        let mut concatenated = String::new();

        for line in lines.by_ref() {
            if line.trim() == BUILD_END {
                break;
            }
            if let Some(href) = link_href(line) {
                let css = resolve(href)?;
                concatenated.push_str(&css);
                if !concatenated.ends_with('\n') {
                    concatenated.push('\n');
                }
            }
        }

        out.push(format!(
            "{indent}<link rel=\"stylesheet\" href=\"{link_prefix}{target}\">"
        ));
        bundles.push((Utf8PathBuf::from(target), concatenated));
    }

    let mut text = out.join("\n");
    if html.ends_with('\n') {
        text.push('\n');
    }
    Ok((text, bundles))
}

fn link_href(line: &str) -> Option<&str> {
    let rest = line.split("href=\"").nth(1)?;
    rest.split('"').next()
}

/// `../` prefix climbing from a file at `rel` (relative to the output
/// root) back up to the root.
pub fn ascend_prefix(rel: &Utf8Path) -> String {
    let depth = rel.parent().map_or(0, |p| p.components().count());
    "../".repeat(depth)
}

/// Resolve a document href against a list of search roots: the leading
/// parent-directory hops are stripped and the remainder looked up under
/// each root in order.
pub fn resolve_href(href: &str, roots: &[Utf8PathBuf]) -> anyhow::Result<String> {
    let mut rel = Utf8Path::new(href.trim_start_matches("./"));
    while let Ok(stripped) = rel.strip_prefix("..") {
        rel = stripped;
    }

    for root in roots {
        let candidate = root.join(rel);
        if candidate.is_file() {
            return fs::read_to_string(&candidate)
                .map_err(|e| anyhow::anyhow!("couldn't read '{candidate}': {e}"));
        }
        // Also accept hrefs whose directory prefix names the search root
        // itself, e.g. "../styles/app.css" against a root ending in
        // "styles".
        if let Some(name) = root.file_name()
            && let Ok(inner) = rel.strip_prefix(name)
        {
            let candidate = root.join(inner);
            if candidate.is_file() {
                return fs::read_to_string(&candidate)
                    .map_err(|e| anyhow::anyhow!("couldn't read '{candidate}': {e}"));
            }
        }
    }

    anyhow::bail!("stylesheet '{href}' not found under any search root")
}
