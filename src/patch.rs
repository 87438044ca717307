//! Unified diff application.
//!
//! Patches are applied the way `patch -p1` would apply them, minus fuzz:
//! every context and removed line must match exactly, but a hunk may be found
//! some lines away from where its header says. Files are handled as bytes, so
//! sources in any encoding patch cleanly. Each patch is checked in full
//! before anything is written, so a failing patch leaves the tree as the
//! previous patch left it.
//!
//! Hunk parsing and matching is done by `diffy`; this module splits a
//! multi-file diff into sections, resolves their paths and stages the result.

use crate::error::{DebrewError, Result};
use diffy::Patch;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// One file section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSection<'a> {
    /// Path after `-p1` stripping; `None` for `/dev/null`.
    pub old_path: Option<PathBuf>,
    pub new_path: Option<PathBuf>,
    /// Number of hunks in the section.
    pub hunks: usize,
    /// From the `---` header through the last hunk line.
    pub body: &'a [u8],
}

impl FileSection<'_> {
    fn display_path(&self) -> String {
        self.new_path
            .as_ref()
            .or(self.old_path.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/dev/null".to_string())
    }
}

/// Apply `patches` in order to the tree at `source_root`.
///
/// Each identifier is resolved against `patch_dir` and must stay inside it.
/// Stops at the first patch that does not apply and reports its zero-based
/// index.
pub fn apply_patches(patches: &[String], patch_dir: Option<&Path>, source_root: &Path) -> Result<()> {
    for (index, patch) in patches.iter().enumerate() {
        let failed = |reason: String| DebrewError::PatchFailed {
            index,
            patch: patch.clone(),
            reason,
        };

        let path = match patch_dir {
            Some(dir) => dir.join(relative_identifier(patch).map_err(failed)?),
            None => PathBuf::from(patch),
        };

        let text = fs::read(&path)
            .map_err(|e| failed(format!("cannot read {}: {e}", path.display())))?;
        let files = apply_patch(&text, source_root).map_err(failed)?;
        info!(patch = %patch, index, files, "applied patch");
    }
    Ok(())
}

/// A patch identifier as a path below the patch directory.
fn relative_identifier(patch: &str) -> std::result::Result<&Path, String> {
    let path = Path::new(patch);
    let inside = !patch.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if inside {
        Ok(path)
    } else {
        Err(format!("patch `{patch}` is not a path inside the patch directory"))
    }
}

/// Apply one unified diff to `root`, returning the number of files touched.
pub fn apply_patch(text: &[u8], root: &Path) -> std::result::Result<usize, String> {
    let sections = split_patch(text)?;
    if sections.is_empty() {
        return Err("no file sections found".to_string());
    }

    // Stage every result in memory first; `None` marks a deletion.
    let mut pending: BTreeMap<PathBuf, Option<Vec<u8>>> = BTreeMap::new();

    for section in &sections {
        let patch = Patch::from_bytes(section.body)
            .map_err(|e| format!("cannot parse section for {}: {e}", section.display_path()))?;
        let apply = |base: &[u8], path: &Path| {
            diffy::apply_bytes(base, &patch).map_err(|e| format!("{}: {e}", path.display()))
        };
        let current = |pending: &BTreeMap<PathBuf, Option<Vec<u8>>>, path: &Path| {
            read_current(pending, root, path)
        };

        match (&section.old_path, &section.new_path) {
            (None, Some(new_path)) => {
                if current(&pending, new_path)?.is_some() {
                    return Err(format!("{} already exists", new_path.display()));
                }
                let created = apply(&[], new_path)?;
                pending.insert(new_path.clone(), Some(created));
            }
            (Some(old_path), None) => {
                let content = current(&pending, old_path)?
                    .ok_or_else(|| format!("{} does not exist", old_path.display()))?;
                if !apply(&content, old_path)?.is_empty() {
                    return Err(format!(
                        "{} has content the deletion does not account for",
                        old_path.display()
                    ));
                }
                pending.insert(old_path.clone(), None);
            }
            (Some(old_path), Some(new_path)) => {
                // GNU patch prefers the old name when both exist.
                let (source, content) = match current(&pending, old_path)? {
                    Some(content) => (old_path, content),
                    None => match current(&pending, new_path)? {
                        Some(content) => (new_path, content),
                        None => return Err(format!("{} does not exist", old_path.display())),
                    },
                };
                let patched = apply(&content, source)?;
                pending.insert(source.clone(), Some(patched));
            }
            (None, None) => return Err("file section names /dev/null twice".to_string()),
        }
    }

    for (relative, content) in &pending {
        refuse_symlinks(root, relative)?;
        let target = root.join(relative);
        match content {
            Some(content) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                fs::write(&target, content)
                    .map_err(|e| format!("cannot write {}: {e}", relative.display()))?;
            }
            None => fs::remove_file(&target)
                .map_err(|e| format!("cannot remove {}: {e}", relative.display()))?,
        }
        debug!(path = %relative.display(), "patched");
    }

    Ok(pending.len())
}

fn read_current(
    pending: &BTreeMap<PathBuf, Option<Vec<u8>>>,
    root: &Path,
    relative: &Path,
) -> std::result::Result<Option<Vec<u8>>, String> {
    if let Some(staged) = pending.get(relative) {
        return Ok(staged.clone());
    }
    refuse_symlinks(root, relative)?;
    let path = root.join(relative);
    if !path.is_file() {
        return Ok(None);
    }
    fs::read(&path)
        .map(Some)
        .map_err(|e| format!("cannot read {}: {e}", relative.display()))
}

/// Fails if `relative` or any directory leading to it is a symlink.
fn refuse_symlinks(root: &Path, relative: &Path) -> std::result::Result<(), String> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(format!(
                    "refusing to patch through symlink {}",
                    relative.display()
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(format!("cannot inspect {}: {e}", relative.display())),
        }
    }
    Ok(())
}

/// Split a unified diff into its file sections.
///
/// Text before, between and after sections (commit messages, `diff --git`
/// and `index` lines) is skipped. Hunk bodies are delimited by the counts in
/// their headers, so a removed line that itself starts with `-- ` is not
/// mistaken for a new section.
pub fn split_patch(text: &[u8]) -> std::result::Result<Vec<FileSection<'_>>, String> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive(|&b| b == b'\n') {
        lines.push((offset, line));
        offset += line.len();
    }
    let start_of = |i: usize| lines.get(i).map_or(text.len(), |(offset, _)| *offset);

    let mut sections = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(old_header) = lines[i].1.strip_prefix(b"--- ") else {
            i += 1;
            continue;
        };
        let new_header = lines
            .get(i + 1)
            .and_then(|(_, line)| line.strip_prefix(b"+++ "))
            .ok_or_else(|| format!("line {}: `---` header without `+++`", i + 1))?;

        let old_path = header_path(old_header)?;
        let new_path = header_path(new_header)?;
        let start = start_of(i);
        i += 2;

        let mut hunks = 0;
        while i < lines.len() && lines[i].1.starts_with(b"@@ ") {
            let (mut old_left, mut new_left) = hunk_lengths(lines[i].1)
                .ok_or_else(|| format!("line {}: malformed hunk header", i + 1))?;
            i += 1;
            hunks += 1;

            while old_left > 0 || new_left > 0 {
                let Some((_, line)) = lines.get(i) else {
                    return Err(format!("hunk #{hunks} ends early"));
                };
                match line.first() {
                    Some(b' ' | b'\n' | b'\r') => {
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                    Some(b'-') => old_left = old_left.saturating_sub(1),
                    Some(b'+') => new_left = new_left.saturating_sub(1),
                    Some(b'\\') => {}
                    _ => return Err(format!("line {}: unexpected line inside hunk", i + 1)),
                }
                i += 1;
            }
            // "\ No newline at end of file" after the last line
            while i < lines.len() && lines[i].1.starts_with(b"\\") {
                i += 1;
            }
        }
        if hunks == 0 {
            return Err(format!("line {i}: file section without hunks"));
        }

        sections.push(FileSection {
            old_path,
            new_path,
            hunks,
            body: &text[start..start_of(i)],
        });
    }

    Ok(sections)
}

/// Old and new line counts from `@@ -a[,b] +c[,d] @@`.
fn hunk_lengths(header: &[u8]) -> Option<(usize, usize)> {
    let header = std::str::from_utf8(header).ok()?;
    let ranges = header.strip_prefix("@@ ")?.split(" @@").next()?;
    let mut parts = ranges.split_whitespace();
    let old = parts.next()?.strip_prefix('-').and_then(range_length)?;
    let new = parts.next()?.strip_prefix('+').and_then(range_length)?;
    Some((old, new))
}

/// `12,3` -> 3; `12` -> 1.
fn range_length(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((start, len)) => {
            start.parse::<usize>().ok()?;
            len.parse().ok()
        }
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

/// Header path with `-p1` applied; `/dev/null` is `None`.
fn header_path(header: &[u8]) -> std::result::Result<Option<PathBuf>, String> {
    let header = std::str::from_utf8(header)
        .map_err(|_| "file header is not valid UTF-8".to_string())?;
    let raw = header.split('\t').next().unwrap_or(header).trim();
    if raw == "/dev/null" {
        return Ok(None);
    }

    let stripped = raw
        .split_once('/')
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| format!("cannot strip one component from `{raw}`"))?;

    let path = Path::new(stripped);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(format!("refusing path outside the source tree: `{raw}`"));
    }
    Ok(Some(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAKEFILE: &str = "all:\n\tgo build\n\ninstall:\n\tcp azcopy /usr/bin\n";

    const FIX_PREFIX: &str = "\
--- a/Makefile
+++ b/Makefile
@@ -4,2 +4,2 @@
 install:
-\tcp azcopy /usr/bin
+\tcp azcopy $(PREFIX)/bin
";

    #[test]
    fn test_split_header_and_hunks() {
        let sections = split_patch(FIX_PREFIX.as_bytes()).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].old_path, Some(PathBuf::from("Makefile")));
        assert_eq!(sections[0].hunks, 1);
        assert_eq!(sections[0].body, FIX_PREFIX.as_bytes());
        assert_eq!(range_length("7"), Some(1));
        assert_eq!(hunk_lengths(b"@@ -0,0 +1,2 @@\n"), Some((0, 2)));
    }

    #[test]
    fn test_split_skips_git_preamble_and_dash_lines() {
        let patch = "\
From 1234 Mon Sep 17 00:00:00 2001
Subject: tidy

diff --git a/notes b/notes
index 1..2 100644
--- a/notes
+++ b/notes
@@ -1,2 +1,1 @@
--- old rule
 keep
diff --git a/other b/other
--- a/other
+++ b/other
@@ -1 +1 @@
-x
+y
";
        let sections = split_patch(patch.as_bytes()).unwrap();
        assert_eq!(sections.len(), 2);
        assert!(sections[0].body.ends_with(b" keep\n"));
        assert_eq!(sections[1].new_path, Some(PathBuf::from("other")));
    }

    #[test]
    fn test_apply_modifies_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), MAKEFILE).unwrap();

        assert_eq!(apply_patch(FIX_PREFIX.as_bytes(), dir.path()).unwrap(), 1);
        let patched = fs::read_to_string(dir.path().join("Makefile")).unwrap();
        assert!(patched.ends_with("\tcp azcopy $(PREFIX)/bin\n"));
        assert!(patched.starts_with("all:\n"));
    }

    #[test]
    fn test_hunk_found_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let shifted = format!("# generated\n# do not edit\n{MAKEFILE}");
        fs::write(dir.path().join("Makefile"), shifted).unwrap();

        apply_patch(FIX_PREFIX.as_bytes(), dir.path()).unwrap();
        let patched = fs::read_to_string(dir.path().join("Makefile")).unwrap();
        assert!(patched.contains("$(PREFIX)"));
        assert!(patched.starts_with("# generated\n"));
    }

    #[test]
    fn test_context_mismatch_is_not_fuzzed() {
        let dir = tempfile::tempdir().unwrap();
        let drifted = MAKEFILE.replace("install:", "install: all");
        fs::write(dir.path().join("Makefile"), &drifted).unwrap();

        let err = apply_patch(FIX_PREFIX.as_bytes(), dir.path()).unwrap_err();
        assert!(err.contains("Makefile"));
        assert_eq!(fs::read_to_string(dir.path().join("Makefile")).unwrap(), drifted);
    }

    #[test]
    fn test_non_utf8_file_is_patched() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README"), b"caf\xe9\nline2\n").unwrap();
        let patch = b"--- a/README\n+++ b/README\n@@ -2 +2 @@\n-line2\n+line3\n";

        apply_patch(patch, dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("README")).unwrap(), b"caf\xe9\nline3\n");
    }

    #[test]
    fn test_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        let patch = "\
--- /dev/null
+++ b/debian/notes.txt
@@ -0,0 +1,2 @@
+hello
+world
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";
        assert_eq!(apply_patch(patch.as_bytes(), dir.path()).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("debian/notes.txt")).unwrap(),
            "hello\nworld\n"
        );
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn test_no_newline_marker() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("VERSION"), "1.0.1").unwrap();
        let patch = "\
--- a/VERSION
+++ b/VERSION
@@ -1 +1 @@
-1.0.1
\\ No newline at end of file
+1.0.2
";
        apply_patch(patch.as_bytes(), dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("VERSION")).unwrap(), "1.0.2\n");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let patch = b"--- a/../../etc/passwd\n+++ b/../../etc/passwd\n@@ -1 +1 @@\n-x\n+y\n";
        assert!(apply_patch(patch, dir.path()).unwrap_err().contains("outside"));
    }

    #[cfg(unix)]
    #[test]
    fn test_refuses_to_write_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("config"), "x\n").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("etc")).unwrap();

        let patch = b"--- a/etc/config\n+++ b/etc/config\n@@ -1 +1 @@\n-x\n+y\n";
        let err = apply_patch(patch, dir.path()).unwrap_err();

        assert!(err.contains("symlink"));
        assert_eq!(fs::read_to_string(outside.path().join("config")).unwrap(), "x\n");
    }

    #[test]
    fn test_rejects_escaping_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let patches = dir.path().join("patches");
        fs::create_dir_all(&patches).unwrap();
        fs::write(dir.path().join("stray.patch"), FIX_PREFIX).unwrap();

        for name in ["../stray.patch", "/etc/passwd", ""] {
            let err = apply_patches(&[name.to_string()], Some(&patches), dir.path()).unwrap_err();
            match err {
                DebrewError::PatchFailed { index: 0, reason, .. } => {
                    assert!(reason.contains("inside the patch directory"), "{reason}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_missing_patch_file_reports_index() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_patches(&["absent.patch".to_string()], Some(dir.path()), dir.path())
            .unwrap_err();
        assert!(matches!(err, DebrewError::PatchFailed { index: 0, .. }));
    }
}
