//! Source archive extraction into a build context.
//!
//! Upstream artifacts are tarballs with one of several compressions. The
//! compression is sniffed from the magic bytes rather than the file name,
//! since URLs like `.../archive/v10.7.0` say nothing useful:
//!
//! | magic            | format  |
//! |------------------|---------|
//! | `1f 8b`          | gzip    |
//! | `BZh`            | bzip2   |
//! | `fd 37 7a 58 5a` | xz      |
//! | anything else    | raw tar |
//!
//! Most upstream tarballs wrap everything in one top-level directory
//! (`go/`, `libvirt-1.0.2/`). That directory is the *source root* that
//! patches and build steps run in:
//! ```text
//! src/
//!   libvirt-1.0.2/     <- source root
//!     configure
//!     src/
//! ```

use crate::error::{DebrewError, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    None,
}

impl Compression {
    pub fn sniff(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a]) {
            Self::Xz
        } else {
            Self::None
        }
    }
}

/// Unpack `archive_path` into `dest` and return the source root.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest)?;

    let mut magic = [0u8; 6];
    let read = fs::File::open(archive_path)?.read(&mut magic)?;
    let compression = Compression::sniff(&magic[..read]);
    debug!(archive = %archive_path.display(), ?compression, "extracting");

    let file = BufReader::new(fs::File::open(archive_path)?);
    let reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(BzDecoder::new(file)),
        Compression::Xz => Box::new(XzDecoder::new(file)),
        Compression::None => Box::new(file),
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    // `unpack` refuses entries that would land outside `dest`
    archive.unpack(dest).map_err(|e| {
        DebrewError::ExtractError(format!("{}: {e}", archive_path.display()))
    })?;

    let root = source_root(dest)?;
    if fs::read_dir(&root)?.next().is_none() {
        return Err(DebrewError::ExtractError(format!(
            "{} contains no files",
            archive_path.display()
        )));
    }
    Ok(root)
}

/// The single top-level directory of an extracted tree, or the tree itself.
pub fn source_root(dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path());

    match (entries.next(), entries.next()) {
        (Some(only), None) if only.is_dir() => Ok(only),
        _ => Ok(dir.to_path_buf()),
    }
}
