//! Recursive directory copy, used to materialize an overlay mount's
//! snapshot directory from its host source tree.

use std::path::Path;

/// Recursively copies `src` into `dst`, creating `dst` and any
/// intermediate directories as needed.
///
/// A symlink whose resolved target stays within `src` is recreated as a
/// symlink (with the same target string) so internal link structure is
/// preserved. A symlink whose target resolves outside `src` -- an
/// absolute path elsewhere on the host, or a `../` escape -- has its
/// *contents* copied in instead of the link itself, so the snapshot never
/// ends up holding a live pointer out of the directory it's supposed to
/// be a self-contained copy of. A dangling symlink (target doesn't exist)
/// is skipped: there's nothing to materialize and nothing to escape.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let src_canonical = std::fs::canonicalize(src)?;
    copy_dir_recursive_inner(src, &src_canonical, dst)
}

fn copy_dir_recursive_inner(src: &Path, src_canonical: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_recursive_inner(&from, src_canonical, &to)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&from)?;
            let resolved = if target.is_absolute() {
                target.clone()
            } else {
                from.parent().unwrap_or(src).join(&target)
            };
            let stays_inside = std::fs::canonicalize(&resolved)
                .map(|c| c.starts_with(src_canonical))
                .unwrap_or(false);

            if stays_inside {
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &to)?;
                #[cfg(not(unix))]
                copy_symlink_referent(&from, &to)?;
            } else {
                copy_symlink_referent(&from, &to)?;
            }
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Copies what a symlink points at (file or directory contents), used
/// when the link itself can't be safely recreated in the snapshot.
fn copy_symlink_referent(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::metadata(from) {
        Ok(meta) if meta.is_dir() => {
            let canonical = std::fs::canonicalize(from)?;
            copy_dir_recursive_inner(from, &canonical, to)
        }
        Ok(_) => std::fs::copy(from, to).map(|_| ()),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_files_and_dirs() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let snapshot = dst.path().join("snap");
        copy_dir_recursive(src.path(), &snapshot).unwrap();

        assert_eq!(std::fs::read(snapshot.join("a.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(snapshot.join("sub/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn snapshot_is_independent_of_later_source_mutation() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"v1").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let snapshot = dst.path().join("snap");
        copy_dir_recursive(src.path(), &snapshot).unwrap();

        std::fs::write(src.path().join("a.txt"), b"v2").unwrap();
        assert_eq!(std::fs::read(snapshot.join("a.txt")).unwrap(), b"v1");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_within_src_is_recreated_as_a_symlink() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("real.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let snapshot = dst.path().join("snap");
        copy_dir_recursive(src.path(), &snapshot).unwrap();

        let copied = snapshot.join("link.txt");
        assert!(std::fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&copied).unwrap(), b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_src_is_materialized_as_content_not_a_pointer() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"outside-data").unwrap();

        let src = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), src.path().join("escape.txt"))
            .unwrap();

        let dst = tempfile::tempdir().unwrap();
        let snapshot = dst.path().join("snap");
        copy_dir_recursive(src.path(), &snapshot).unwrap();

        let copied = snapshot.join("escape.txt");
        assert!(!std::fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&copied).unwrap(), b"outside-data");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_skipped() {
        let src = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(src.path().join("nope"), src.path().join("dangling.txt")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let snapshot = dst.path().join("snap");
        copy_dir_recursive(src.path(), &snapshot).unwrap();

        assert!(!snapshot.join("dangling.txt").exists());
    }
}
