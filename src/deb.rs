//! Package assembly and `.deb` writing.
//!
//! A `.deb` is an `ar` archive with exactly three members, in this order:
//! - `debian-binary`: the format version, `2.0\n`
//! - `control.tar.gz`: `./control` and `./md5sums`
//! - `data.tar.gz`: the staged tree, rooted at `/`
//!
//! Output is reproducible: entries are sorted, every mtime is the configured
//! `SOURCE_DATE_EPOCH`, owners are root, and the gzip headers carry no
//! timestamp. Building the same formula twice gives identical bytes.

use crate::build::BuildState;
use crate::context::BuildContext;
use crate::error::{DebrewError, Result};
use crate::formula::{Dependency, Formula};
use crate::version::{self, Version, VersionRegistry};
use flate2::{Compression, GzBuilder};
use md5::{Digest, Md5};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const DEBIAN_BINARY: &[u8] = b"2.0\n";

/// Everything that goes into one `.deb`.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: Version,
    pub architecture: String,
    pub maintainer: String,
    pub depends: Vec<Dependency>,
    /// Kept for reporting; never written to the control file.
    pub build_depends: Vec<Dependency>,
    pub conflicts: Vec<String>,
    pub replaces: Vec<String>,
    pub provides: Vec<String>,
    pub section: Option<String>,
    pub homepage: Option<String>,
    pub description: String,
    /// Sum of staged file sizes in KiB, rounded up.
    pub installed_size: u64,
    payload: PathBuf,
}

impl Package {
    /// Describe the staged tree of a finished build.
    ///
    /// # Errors
    ///
    /// [`DebrewError::AssemblyError`] when the build did not reach `Installed`,
    /// the stage is empty, a field still holds a `#{...}` placeholder, or a
    /// dependency constraint contradicts a version produced in this run.
    pub fn assemble(
        formula: &Formula,
        ctx: &BuildContext,
        state: BuildState,
        registry: &VersionRegistry,
        default_maintainer: &str,
        host_arch: &str,
    ) -> Result<Self> {
        if state != BuildState::Installed {
            return Err(DebrewError::assembly(format!(
                "{} build is {state}, not installed",
                formula.id()
            )));
        }
        ctx.ensure_valid()?;

        for dep in formula.depends().iter().chain(formula.build_depends()) {
            registry.check(&dep.name, dep.constraint.as_ref())?;
        }

        let package = Self {
            name: formula.name().to_string(),
            version: formula.version().clone(),
            architecture: formula.arch().unwrap_or(host_arch).to_string(),
            maintainer: formula
                .maintainer()
                .unwrap_or(default_maintainer)
                .to_string(),
            depends: formula.depends().to_vec(),
            build_depends: formula.build_depends().to_vec(),
            conflicts: formula.conflicts().iter().cloned().collect(),
            replaces: formula.replaces().iter().cloned().collect(),
            provides: formula.provides().iter().cloned().collect(),
            section: formula.section().map(str::to_string),
            homepage: formula.homepage().map(str::to_string),
            description: formula
                .description()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} {}", formula.name(), formula.version().upstream())),
            installed_size: installed_size(ctx.stage_dir())?,
            payload: ctx.stage_dir().to_path_buf(),
        };

        package.check_placeholders()?;
        if !has_files(&package.payload) {
            return Err(DebrewError::assembly(format!(
                "{}: staging tree is empty",
                formula.id()
            )));
        }

        Ok(package)
    }

    fn check_placeholders(&self) -> Result<()> {
        let mut fields: Vec<(&str, String)> = vec![
            ("Package", self.name.clone()),
            ("Version", self.version.to_string()),
            ("Architecture", self.architecture.clone()),
            ("Maintainer", self.maintainer.clone()),
            ("Description", self.description.clone()),
        ];
        fields.extend(self.section.iter().map(|s| ("Section", s.clone())));
        fields.extend(self.homepage.iter().map(|h| ("Homepage", h.clone())));
        fields.extend(self.depends.iter().map(|d| ("Depends", d.to_string())));
        fields.extend(self.build_depends.iter().map(|d| ("Build-Depends", d.to_string())));

        match fields.iter().find(|(_, value)| version::has_placeholder(value)) {
            Some((field, value)) => Err(DebrewError::assembly(format!(
                "{field} still contains an unresolved placeholder: `{value}`"
            ))),
            None => Ok(()),
        }
    }

    /// Root of the files that become `data.tar.gz`.
    pub fn payload(&self) -> &Path {
        &self.payload
    }

    /// `<name>_<version>_<arch>.deb`, epoch dropped.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.deb",
            self.name,
            self.version.file_component(),
            self.architecture
        )
    }

    /// The `control` file, fields in a fixed order.
    pub fn control(&self) -> String {
        let mut control = format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\nMaintainer: {}\nInstalled-Size: {}\n",
            self.name, self.version, self.architecture, self.maintainer, self.installed_size
        );

        let mut relation = |field: &str, values: Vec<String>| {
            if !values.is_empty() {
                control.push_str(&format!("{field}: {}\n", values.join(", ")));
            }
        };
        relation("Depends", self.depends.iter().map(ToString::to_string).collect());
        relation("Conflicts", self.conflicts.clone());
        relation("Replaces", self.replaces.clone());
        relation("Provides", self.provides.clone());

        if let Some(section) = &self.section {
            control.push_str(&format!("Section: {section}\n"));
        }
        if let Some(homepage) = &self.homepage {
            control.push_str(&format!("Homepage: {homepage}\n"));
        }
        control.push_str(&description_field(&self.description));
        control
    }

    /// Write the package into `out_dir` and return its path.
    ///
    /// The archive is written under a temporary name and renamed into place,
    /// so a failed write never leaves a partial `.deb` behind.
    pub fn write_deb(&self, out_dir: &Path, mtime: u64) -> Result<PathBuf> {
        fs::create_dir_all(out_dir)?;
        let final_path = out_dir.join(self.file_name());
        let pid = std::process::id();
        let data_path = out_dir.join(format!(".{}.data-{pid}", self.file_name()));
        let partial = out_dir.join(format!(".{}.part-{pid}", self.file_name()));

        let result = self
            .write_parts(&data_path, &partial, mtime)
            .and_then(|()| fs::rename(&partial, &final_path).map_err(DebrewError::from));
        let _ = fs::remove_file(&data_path);
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result?;

        info!(path = %final_path.display(), "wrote package");
        Ok(final_path)
    }

    fn write_parts(&self, data_path: &Path, partial: &Path, mtime: u64) -> Result<()> {
        let entries = payload_entries(&self.payload)?;
        let md5sums = md5sums(&self.payload, &entries)?;

        let control_tar = gzip_tar(Vec::new(), |tar| {
            append_control_file(tar, "control", self.control().as_bytes(), mtime)?;
            append_control_file(tar, "md5sums", md5sums.as_bytes(), mtime)
        })?;

        let data_file = BufWriter::new(File::create(data_path)?);
        gzip_tar(data_file, |tar| append_payload(tar, &self.payload, &entries, mtime))?
            .into_inner()
            .map_err(|e| DebrewError::from(e.into_error()))?
            .sync_all()?;
        debug!(entries = entries.len(), "wrote data archive");

        let mut deb = ar::Builder::new(BufWriter::new(File::create(partial)?));
        deb.append(&ar_header("debian-binary", DEBIAN_BINARY.len() as u64, mtime), DEBIAN_BINARY)?;
        deb.append(
            &ar_header("control.tar.gz", control_tar.len() as u64, mtime),
            control_tar.as_slice(),
        )?;
        let data = File::open(data_path)?;
        let data_len = data.metadata()?.len();
        deb.append(&ar_header("data.tar.gz", data_len, mtime), data)?;

        deb.into_inner()?
            .into_inner()
            .map_err(|e| DebrewError::from(e.into_error()))?
            .sync_all()?;
        Ok(())
    }
}

fn ar_header(name: &str, size: u64, mtime: u64) -> ar::Header {
    let mut header = ar::Header::new(name.as_bytes().to_vec(), size);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o100644);
    header
}

/// Build a gzipped tar with a timestamp-free gzip header.
fn gzip_tar<W, F>(out: W, fill: F) -> Result<W>
where
    W: Write,
    F: FnOnce(&mut tar::Builder<flate2::write::GzEncoder<W>>) -> Result<()>,
{
    let encoder = GzBuilder::new().mtime(0).write(out, Compression::default());
    let mut tar = tar::Builder::new(encoder);
    tar.mode(tar::HeaderMode::Deterministic);
    fill(&mut tar)?;
    Ok(tar.into_inner()?.finish()?)
}

fn base_header(mtime: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    // GNU headers always have room for these.
    let _ = header.set_username("root");
    let _ = header.set_groupname("root");
    header
}

fn append_control_file<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    contents: &[u8],
    mtime: u64,
) -> Result<()> {
    let mut header = base_header(mtime);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(contents.len() as u64);
    tar.append_data(&mut header, format!("./{name}"), contents)?;
    Ok(())
}

/// Staged paths relative to the payload root, sorted.
fn payload_entries(root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_path_buf();
        entries.push(relative);
    }
    Ok(entries)
}

fn append_payload<W: Write>(
    tar: &mut tar::Builder<W>,
    root: &Path,
    entries: &[PathBuf],
    mtime: u64,
) -> Result<()> {
    for relative in entries {
        let path = root.join(relative);
        let meta = fs::symlink_metadata(&path)?;
        let mut header = base_header(mtime);
        header.set_mode(file_mode(&meta));

        if meta.file_type().is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            let target = fs::read_link(&path)?;
            tar.append_link(&mut header, relative, target)?;
        } else if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            tar.append_data(&mut header, relative, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            tar.append_data(&mut header, relative, File::open(&path)?)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

/// `md5sums` body: `<hex>  <path>` for every regular file, in path order.
fn md5sums(root: &Path, entries: &[PathBuf]) -> Result<String> {
    let lines = entries
        .par_iter()
        .filter(|relative| {
            fs::symlink_metadata(root.join(relative))
                .map(|m| m.is_file())
                .unwrap_or(false)
        })
        .map(|relative| -> Result<String> {
            let mut file = File::open(root.join(relative))?;
            let mut hasher = Md5::new();
            let mut buffer = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:x}  {}\n", hasher.finalize(), relative.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(lines.concat())
}

fn installed_size(stage: &Path) -> Result<u64> {
    let mut bytes = 0u64;
    for entry in WalkDir::new(stage) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            bytes += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(bytes.div_ceil(1024))
}

fn has_files(stage: &Path) -> bool {
    WalkDir::new(stage)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| !entry.file_type().is_dir())
}

/// First line is the synopsis; continuation lines are indented, blank ones
/// become ` .`.
fn description_field(text: &str) -> String {
    let mut lines = text.trim().lines();
    let mut field = format!("Description: {}\n", lines.next().unwrap_or_default().trim());
    for line in lines {
        if line.trim().is_empty() {
            field.push_str(" .\n");
        } else {
            field.push(' ');
            field.push_str(line.trim_end());
            field.push('\n');
        }
    }
    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Dependency;

    fn package(payload: &Path) -> Package {
        Package {
            name: "azcopy".into(),
            version: Version::parse("10.7.0+thepwagner1").unwrap(),
            architecture: "amd64".into(),
            maintainer: "Ops <ops@example.com>".into(),
            depends: vec![Dependency::parse("libc6 (>= 2.28)").unwrap()],
            build_depends: vec![Dependency::parse("golang (= 1.15.6+thepwagner1)").unwrap()],
            conflicts: vec![],
            replaces: vec![],
            provides: vec![],
            section: Some("utils".into()),
            homepage: Some("https://github.com/Azure/azure-storage-azcopy".into()),
            description: "AzCopy\nCopies blobs.\n\nFast.".into(),
            installed_size: 1,
            payload: payload.to_path_buf(),
        }
    }

    #[test]
    fn test_control_fields() {
        let control = package(Path::new("/nowhere")).control();
        assert!(control.starts_with("Package: azcopy\nVersion: 10.7.0+thepwagner1\n"));
        assert!(control.contains("Depends: libc6 (>= 2.28)\n"));
        assert!(!control.contains("golang"));
        assert!(!control.contains("Conflicts"));
        assert!(control.ends_with("Description: AzCopy\n Copies blobs.\n .\n Fast.\n"));
    }

    #[test]
    fn test_file_name_drops_epoch() {
        let mut pkg = package(Path::new("/nowhere"));
        pkg.version = Version::parse("2:1.0.2+github1").unwrap();
        assert_eq!(pkg.file_name(), "azcopy_1.0.2+github1_amd64.deb");
    }

    #[test]
    fn test_placeholder_is_rejected() {
        let mut pkg = package(Path::new("/nowhere"));
        pkg.homepage = Some("https://example.com/#{missing}".into());
        assert!(matches!(
            pkg.check_placeholders(),
            Err(DebrewError::AssemblyError(_))
        ));
    }

    #[test]
    fn test_deb_layout_and_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join("stage");
        fs::create_dir_all(stage.join("usr/local/bin")).unwrap();
        fs::write(stage.join("usr/local/bin/azcopy"), "#!/bin/sh\necho hi\n").unwrap();
        let pkg = package(&stage);

        let first = pkg.write_deb(&dir.path().join("a"), 0).unwrap();
        let second = pkg.write_deb(&dir.path().join("b"), 0).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());

        let mut archive = ar::Archive::new(File::open(&first).unwrap());
        let mut members = Vec::new();
        while let Some(entry) = archive.next_entry() {
            let entry = entry.unwrap();
            members.push(String::from_utf8(entry.header().identifier().to_vec()).unwrap());
        }
        assert_eq!(members, ["debian-binary", "control.tar.gz", "data.tar.gz"]);

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_description_field() {
        assert_eq!(description_field("one line"), "Description: one line\n");
    }
}
