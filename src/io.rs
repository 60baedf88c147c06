use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Write `data` to `path` atomically. The bytes go to a temporary file in
/// the destination directory which is then persisted by rename, so a crash
/// mid-write never leaves a partial output file behind. When the file
/// already holds byte-identical content nothing is rewritten.
///
/// Returns whether the file was actually (re)written.
pub fn write_atomic(path: &Utf8Path, data: &[u8]) -> std::io::Result<bool> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(dir)?;

    if path.is_file() {
        let existing = blake3::Hasher::new().update(&fs::read(path)?).finalize();
        let incoming = blake3::Hasher::new().update(data).finalize();
        if existing == incoming {
            return Ok(false);
        }
    }

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(true)
}

/// Recursively copy a directory tree, preserving relative structure.
/// Returns the number of files copied. A missing source tree copies
/// nothing.
pub fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<usize> {
    if !src.is_dir() {
        return Ok(0);
    }

    fs::create_dir_all(dst)?;

    let mut copied = 0;
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Delete every listed directory if it exists.
pub fn remove_dirs<'a>(dirs: impl IntoIterator<Item = &'a Utf8Path>) -> std::io::Result<()> {
    for dir in dirs {
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
            tracing::debug!("removed {dir}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 tempdir");
        (dir, path)
    }

    #[test]
    fn write_atomic_creates_parent_directories() {
        let (_guard, root) = tempdir();
        let path = root.join("a/b/c.txt");

        let written = write_atomic(&path, b"hello").expect("write");

        assert!(written);
        assert_eq!(fs::read(&path).expect("read back"), b"hello");
    }

    #[test]
    fn write_atomic_skips_identical_content() {
        let (_guard, root) = tempdir();
        let path = root.join("out.css");

        assert!(write_atomic(&path, b"body{}").expect("first write"));
        assert!(!write_atomic(&path, b"body{}").expect("identical write"));
        assert!(write_atomic(&path, b"body{color:red}").expect("changed write"));
    }

    #[test]
    fn copy_tree_preserves_structure() {
        let (_guard, root) = tempdir();
        let src = root.join("src");
        fs::create_dir_all(src.join("nested")).expect("mkdir");
        fs::write(src.join("top.txt"), "top").expect("write");
        fs::write(src.join("nested/deep.txt"), "deep").expect("write");

        let dst = root.join("dst");
        let copied = copy_tree(&src, &dst).expect("copy");

        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(dst.join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(dst.join("nested/deep.txt")).unwrap(),
            "deep"
        );
    }

    #[test]
    fn copy_tree_of_missing_source_copies_nothing() {
        let (_guard, root) = tempdir();
        let copied = copy_tree(&root.join("absent"), &root.join("dst")).expect("copy");
        assert_eq!(copied, 0);
        assert!(!root.join("dst").exists());
    }

    #[test]
    fn remove_dirs_is_idempotent() {
        let (_guard, root) = tempdir();
        let dir = root.join("gen");
        fs::create_dir_all(&dir).expect("mkdir");

        remove_dirs([dir.as_path()]).expect("first removal");
        assert!(!dir.exists());
        remove_dirs([dir.as_path()]).expect("second removal");
    }
}
