//! Backup container codec.
//!
//! A container is a plain tar file named `<slug>.tar`:
//! - `backup.json`: the [`Manifest`] header, always first and unencrypted
//! - one member per source (`homeassistant.tar.zst`, `addon_<slug>.tar.zst`,
//!   `folder_<name>.tar.zst`), each a zstd-compressed tar of the source
//!   directory, sealed with [`crypto`] when the backup is protected.
//!
//! Writing is atomic: members are staged and the container is assembled under
//! `.tmp-` names inside the destination directory, then renamed into place.
//! All functions here are blocking; callers run them on the blocking pool.

pub mod crypto;
pub mod manifest;

use crate::components::{is_valid_addon_slug, is_valid_folder_id};
use crate::fs::walker::{is_always_excluded, walk_directory, WalkOptions};
use crate::utils::{BackupError, Result};
use crypto::{ArchiveKey, DecryptReader, EncryptWriter};
use manifest::{Manifest, ManifestEntry, SourceKind, FORMAT_VERSION, HEADER_NAME};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of every temporary file or directory the codec creates.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Container file extension.
pub const ARCHIVE_EXTENSION: &str = "tar";

/// A directory to capture into one container member.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub walk: WalkOptions,
}

/// A directory that receives one member on extraction.
#[derive(Debug, Clone)]
pub struct ExtractTarget {
    pub kind: SourceKind,
    pub path: PathBuf,
}

/// A committed container on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHandle {
    pub path: PathBuf,
    /// Byte length of the container file.
    pub size: u64,
}

/// Tunables for [`write`].
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// zstd level (1-22)
    pub compression_level: i32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { compression_level: 3 }
    }
}

/// Container file name for a slug.
pub fn archive_file_name(slug: &str) -> String {
    format!("{}.{}", slug, ARCHIVE_EXTENSION)
}

/// Write a new container for `manifest` into `destination`.
///
/// `manifest.entries` and `manifest.crypto` are filled in here. On any error,
/// including cancellation, nothing is left behind in `destination`.
pub fn write(
    mut manifest: Manifest,
    sources: &[ArchiveSource],
    destination: &Path,
    passphrase: Option<&str>,
    options: &WriteOptions,
    cancel: &CancellationToken,
) -> Result<(Manifest, ArchiveHandle)> {
    let key = match passphrase {
        Some(passphrase) => {
            let (key, header) = ArchiveKey::generate(passphrase)?;
            manifest.crypto = Some(header);
            Some(key)
        }
        None => {
            manifest.crypto = None;
            None
        }
    };
    manifest.protected = key.is_some();
    manifest.entries.clear();

    let mut names: HashMap<String, &SourceKind> = HashMap::new();
    for source in sources {
        let name = source.kind.entry_name(key.is_some());
        if let Some(other) = names.insert(name.clone(), &source.kind) {
            return Err(BackupError::InvalidOption(format!(
                "{} and {} would both be stored as {}",
                other, source.kind, name
            )));
        }
    }

    let staging = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(destination)?;

    let mut staged = Vec::with_capacity(sources.len());
    for source in sources {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let name = source.kind.entry_name(key.is_some());
        let staged_path = staging.path().join(&name);
        let (size, sha256) = stage_source(source, &staged_path, key.as_ref(), options, cancel)?;
        debug!(entry = %name, size, "Staged archive member");
        manifest.entries.push(ManifestEntry {
            name,
            source: source.kind.clone(),
            size,
            sha256,
        });
        staged.push(staged_path);
    }

    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }

    let mut container = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tar")
        .tempfile_in(destination)?;
    {
        let mut builder = tar::Builder::new(BufWriter::new(container.as_file_mut()));
        append_header(&mut builder, &manifest)?;
        for (entry, staged_path) in manifest.entries.iter().zip(&staged) {
            let mut file = File::open(staged_path)?;
            builder.append_file(&entry.name, &mut file)?;
        }
        let mut out = builder.into_inner()?;
        out.flush()?;
    }
    container.as_file().sync_all()?;

    let final_path = destination.join(archive_file_name(&manifest.slug));
    let file = container
        .persist_noclobber(&final_path)
        .map_err(|e| BackupError::Io(e.error))?;
    let size = file.metadata()?.len();
    drop(staging);

    info!(slug = %manifest.slug, path = %final_path.display(), size, "Archive written");
    Ok((manifest, ArchiveHandle { path: final_path, size }))
}

/// Read the header of a container without touching its payload.
pub fn read(path: &Path) -> Result<(Manifest, ArchiveHandle)> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut entries = archive.entries().map_err(|e| corrupt(path, e))?;

    let mut first = match entries.next() {
        Some(entry) => entry.map_err(|e| corrupt(path, e))?,
        None => return Err(corrupt(path, "empty container")),
    };
    let name = first.path().map_err(|e| corrupt(path, e))?.to_path_buf();
    if name != Path::new(HEADER_NAME) {
        return Err(corrupt(path, format!("first member is {} not {}", name.display(), HEADER_NAME)));
    }

    let mut raw = Vec::new();
    first.read_to_end(&mut raw).map_err(|e| corrupt(path, e))?;
    let manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| corrupt(path, e))?;
    if manifest.version > FORMAT_VERSION {
        return Err(corrupt(path, format!("unsupported format version {}", manifest.version)));
    }
    if manifest.protected != manifest.crypto.is_some() {
        return Err(corrupt(path, "protection flag disagrees with crypto header"));
    }
    check_source_ids(&manifest).map_err(|e| corrupt(path, e))?;

    Ok((
        manifest,
        ArchiveHandle {
            path: path.to_path_buf(),
            size,
        },
    ))
}

/// Check the passphrase and every member checksum without writing anything.
///
/// Returns the unlocked key for protected archives.
pub fn validate(
    handle: &ArchiveHandle,
    manifest: &Manifest,
    passphrase: Option<&str>,
) -> Result<Option<ArchiveKey>> {
    let key = unlock(manifest, passphrase)?;

    let file = File::open(&handle.path)?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut seen = HashSet::new();

    for entry in archive.entries().map_err(|e| corrupt(&handle.path, e))? {
        let mut entry = entry.map_err(|e| corrupt(&handle.path, e))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(&handle.path, e))?
            .to_string_lossy()
            .to_string();
        if name == HEADER_NAME {
            continue;
        }
        let expected = manifest
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| corrupt(&handle.path, format!("unexpected member {}", name)))?;

        let mut hasher = Sha256::new();
        let copied = io::copy(&mut entry, &mut hasher).map_err(|e| corrupt(&handle.path, e))?;
        let digest = hex::encode(hasher.finalize());
        if copied != expected.size || digest != expected.sha256 {
            return Err(corrupt(&handle.path, format!("checksum mismatch in {}", name)));
        }
        seen.insert(name);
    }

    if let Some(missing) = manifest.entries.iter().find(|e| !seen.contains(&e.name)) {
        return Err(corrupt(&handle.path, format!("missing member {}", missing.name)));
    }

    Ok(key)
}

/// Extract the members named by `targets`, each into its own directory.
///
/// The whole container is validated first, so a wrong passphrase or a
/// corrupt member fails before any target is modified. Existing contents of
/// each target directory are replaced.
pub fn extract(
    handle: &ArchiveHandle,
    manifest: &Manifest,
    passphrase: Option<&str>,
    targets: &[ExtractTarget],
) -> Result<()> {
    let key = validate(handle, manifest, passphrase)?;
    check_targets(handle, manifest, targets)?;
    extract_validated(handle, manifest, key.as_ref(), targets)
}

/// Fail unless every target has a member in the container.
pub fn check_targets(handle: &ArchiveHandle, manifest: &Manifest, targets: &[ExtractTarget]) -> Result<()> {
    match targets.iter().find(|t| manifest.entry(&t.kind).is_none()) {
        Some(target) => Err(corrupt(&handle.path, format!("no member for {}", target.kind))),
        None => Ok(()),
    }
}

/// Extract an archive that already passed [`validate`] and [`check_targets`],
/// using the key `validate` returned.
///
/// Member checksums are still verified while streaming.
pub fn extract_validated(
    handle: &ArchiveHandle,
    manifest: &Manifest,
    key: Option<&ArchiveKey>,
    targets: &[ExtractTarget],
) -> Result<()> {
    let file = File::open(&handle.path)?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    for entry in archive.entries().map_err(|e| corrupt(&handle.path, e))? {
        let entry = entry.map_err(|e| corrupt(&handle.path, e))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(&handle.path, e))?
            .to_string_lossy()
            .to_string();
        let Some(expected) = manifest.entries.iter().find(|e| e.name == name) else {
            continue;
        };
        let Some(target) = targets.iter().find(|t| t.kind == expected.source) else {
            continue;
        };

        info!(source = %target.kind, target = %target.path.display(), "Extracting archive member");
        clear_directory(&target.path)?;
        let mut hashing = HashingReader::new(entry);
        unpack_member(&mut hashing, key, &target.path)
            .map_err(|e| member_error(&handle.path, &name, e))?;
        // Drain padding the inner readers may not have consumed.
        io::copy(&mut hashing, &mut io::sink()).map_err(|e| corrupt(&handle.path, e))?;
        let (copied, digest) = hashing.finish();
        if copied != expected.size || digest != expected.sha256 {
            return Err(corrupt(&handle.path, format!("checksum mismatch in {}", name)));
        }
    }

    Ok(())
}

/// Replace the header of an existing container, keeping all members.
pub fn rewrite_header(handle: &ArchiveHandle, manifest: &Manifest) -> Result<ArchiveHandle> {
    let directory = handle
        .path
        .parent()
        .ok_or_else(|| BackupError::Io(io::Error::new(io::ErrorKind::NotFound, "archive has no parent")))?;

    let mut container = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tar")
        .tempfile_in(directory)?;
    {
        let source = File::open(&handle.path)?;
        let mut archive = tar::Archive::new(BufReader::new(source));
        let mut builder = tar::Builder::new(BufWriter::new(container.as_file_mut()));
        append_header(&mut builder, manifest)?;
        for entry in archive.entries().map_err(|e| corrupt(&handle.path, e))? {
            let mut entry = entry.map_err(|e| corrupt(&handle.path, e))?;
            let name = entry.path().map_err(|e| corrupt(&handle.path, e))?.into_owned();
            if name == Path::new(HEADER_NAME) {
                continue;
            }
            let mut header = entry.header().clone();
            builder.append_data(&mut header, &name, &mut entry)?;
        }
        let mut out = builder.into_inner()?;
        out.flush()?;
    }
    container.as_file().sync_all()?;

    let file = container
        .persist(&handle.path)
        .map_err(|e| BackupError::Io(e.error))?;
    let size = file.metadata()?.len();
    Ok(ArchiveHandle {
        path: handle.path.clone(),
        size,
    })
}

/// Remove temporary files left behind by an interrupted write.
pub fn cleanup_temp_files(directory: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove stale temp file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Reject headers naming add-ons or folders that could escape their data
/// directories.
fn check_source_ids(manifest: &Manifest) -> std::result::Result<(), String> {
    let mut addons = manifest
        .content
        .addons
        .iter()
        .chain(manifest.addons.iter().map(|a| &a.slug));
    if let Some(slug) = addons.find(|slug| !is_valid_addon_slug(slug)) {
        return Err(format!("invalid add-on slug {:?}", slug));
    }
    if let Some(id) = manifest.content.folders.iter().find(|id| !is_valid_folder_id(id)) {
        return Err(format!("invalid folder id {:?}", id));
    }
    for entry in &manifest.entries {
        let valid = match &entry.source {
            SourceKind::Homeassistant => true,
            SourceKind::Addon(slug) => is_valid_addon_slug(slug),
            SourceKind::Folder(id) => is_valid_folder_id(id),
        };
        if !valid {
            return Err(format!("invalid source {} for member {}", entry.source, entry.name));
        }
    }
    Ok(())
}

fn unlock(manifest: &Manifest, passphrase: Option<&str>) -> Result<Option<ArchiveKey>> {
    match (&manifest.crypto, passphrase) {
        (Some(header), Some(passphrase)) => {
            ArchiveKey::unlock(passphrase, header, &manifest.slug).map(Some)
        }
        (Some(_), None) => Err(BackupError::InvalidPassphrase(manifest.slug.clone())),
        (None, _) => Ok(None),
    }
}

fn append_header<W: Write>(builder: &mut tar::Builder<W>, manifest: &Manifest) -> Result<()> {
    let raw = serde_json::to_vec_pretty(manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(raw.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(manifest.date.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, HEADER_NAME, raw.as_slice())?;
    Ok(())
}

/// Output of one staged member: zstd over (optionally) the frame encryptor
/// over a hashing file writer.
enum Sink {
    Plain(HashingWriter<BufWriter<File>>),
    Sealed(EncryptWriter<HashingWriter<BufWriter<File>>>),
}

impl Sink {
    fn finish(self) -> io::Result<HashingWriter<BufWriter<File>>> {
        match self {
            Sink::Plain(writer) => Ok(writer),
            Sink::Sealed(writer) => writer.finish(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(writer) => writer.write(buf),
            Sink::Sealed(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(writer) => writer.flush(),
            Sink::Sealed(writer) => writer.flush(),
        }
    }
}

fn stage_source(
    source: &ArchiveSource,
    staged_path: &Path,
    key: Option<&ArchiveKey>,
    options: &WriteOptions,
    cancel: &CancellationToken,
) -> Result<(u64, String)> {
    let file = HashingWriter::new(BufWriter::new(File::create(staged_path)?));
    let sink = match key {
        Some(key) => Sink::Sealed(EncryptWriter::new(file, key)),
        None => Sink::Plain(file),
    };
    let encoder = zstd::Encoder::new(sink, options.compression_level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    if source.path.is_dir() {
        for info in walk_directory(&source.path, &source.walk)? {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            builder.append_path_with_name(&info.path, &info.relative_path)?;
        }
    } else {
        warn!(source = %source.kind, path = %source.path.display(), "Source directory missing, archiving it empty");
    }

    let encoder = builder.into_inner()?;
    let sink = encoder.finish()?;
    let hashing = sink.finish()?;
    let (mut file, size, sha256) = hashing.finish();
    file.flush()?;
    file.get_ref().sync_all()?;
    Ok((size, sha256))
}

fn unpack_member<R: Read>(reader: R, key: Option<&ArchiveKey>, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    match key {
        Some(key) => unpack_tar(zstd::Decoder::new(DecryptReader::new(reader, key))?, target),
        None => unpack_tar(zstd::Decoder::new(reader)?, target),
    }
}

fn unpack_tar<R: Read>(reader: R, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(target)? {
            let path = entry.path()?.display().to_string();
            return Err(BackupError::CorruptArchive(format!(
                "member path escapes target directory: {}",
                path
            )));
        }
    }
    Ok(())
}

/// Remove everything inside `path`, keeping the directory itself and any
/// always-excluded entries, which a backup never captures.
fn clear_directory(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return fs::create_dir_all(path);
    }
    prune_directory(path).map(|_| ())
}

/// Returns whether anything was kept below `dir`.
fn prune_directory(dir: &Path) -> io::Result<bool> {
    let mut kept = false;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if is_always_excluded(&entry.file_name().to_string_lossy()) {
            kept = true;
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if prune_directory(&path)? {
                kept = true;
            } else {
                fs::remove_dir(&path)?;
            }
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(kept)
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> BackupError {
    BackupError::CorruptArchive(format!("{}: {}", path.display(), err))
}

/// Authentication failures from the decryptor and malformed streams are
/// corruption; anything else is an I/O failure of the target.
fn member_error(path: &Path, name: &str, err: BackupError) -> BackupError {
    match err {
        BackupError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
            corrupt(path, format!("{}: {}", name, e))
        }
        other => other,
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, u64, String) {
        (self.inner, self.written, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    fn finish(self) -> (u64, String) {
        (self.read, hex::encode(self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupType, Content};
    use chrono::Utc;
    use tempfile::TempDir;

    fn manifest(slug: &str) -> Manifest {
        Manifest {
            version: FORMAT_VERSION,
            slug: slug.to_string(),
            name: "test".to_string(),
            date: Utc::now(),
            backup_type: BackupType::Partial,
            content: Content {
                homeassistant: true,
                ..Default::default()
            },
            protected: false,
            homeassistant_exclude_database: false,
            supervisor_version: None,
            addons: vec![],
            entries: vec![],
            crypto: None,
        }
    }

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("configuration.yaml"), b"homeassistant:\n  name: Home\n").unwrap();
        fs::write(dir.join("nested/secrets.yaml"), b"api_key: 1234\n").unwrap();
    }

    fn source(dir: &Path) -> Vec<ArchiveSource> {
        vec![ArchiveSource {
            kind: SourceKind::Homeassistant,
            path: dir.to_path_buf(),
            walk: WalkOptions::default(),
        }]
    }

    fn target(dir: &Path) -> Vec<ExtractTarget> {
        vec![ExtractTarget {
            kind: SourceKind::Homeassistant,
            path: dir.to_path_buf(),
        }]
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_write_read_extract() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        let out = tmp.path().join("out");
        populate(&src);
        fs::create_dir_all(&dest).unwrap();

        let (written, handle) = write(
            manifest("aaaa0001"),
            &source(&src),
            &dest,
            None,
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(handle.path, dest.join("aaaa0001.tar"));
        assert_eq!(handle.size, fs::metadata(&handle.path).unwrap().len());
        assert_eq!(leftovers(&dest), vec!["aaaa0001.tar"]);

        let (read_back, _) = read(&handle.path).unwrap();
        assert_eq!(read_back, written);
        assert_eq!(read_back.entries.len(), 1);

        extract(&handle, &read_back, None, &target(&out)).unwrap();
        assert_eq!(
            fs::read(out.join("nested/secrets.yaml")).unwrap(),
            b"api_key: 1234\n"
        );
    }

    #[test]
    fn test_protected_archive_requires_passphrase() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        populate(&src);

        let (written, handle) = write(
            manifest("aaaa0002"),
            &source(&src),
            tmp.path(),
            Some("hunter2"),
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(written.protected);
        assert!(written.entries[0].name.ends_with(".enc"));

        let err = extract(&handle, &written, Some("wrong"), &target(&out)).unwrap_err();
        assert!(matches!(err, BackupError::InvalidPassphrase(_)));
        assert!(!out.exists());

        let err = validate(&handle, &written, None).unwrap_err();
        assert!(matches!(err, BackupError::InvalidPassphrase(_)));

        extract(&handle, &written, Some("hunter2"), &target(&out)).unwrap();
        assert!(out.join("configuration.yaml").exists());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        populate(&src);

        let (mut written, handle) = write(
            manifest("aaaa0003"),
            &source(&src),
            tmp.path(),
            None,
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        written.entries[0].sha256 = "00".repeat(32);

        let err = validate(&handle, &written, None).unwrap_err();
        assert!(matches!(err, BackupError::CorruptArchive(_)));
    }

    #[test]
    fn test_cancelled_write_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        populate(&src);
        fs::create_dir_all(&dest).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = write(
            manifest("aaaa0004"),
            &source(&src),
            &dest,
            None,
            &WriteOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(leftovers(&dest).is_empty());
    }

    #[test]
    fn test_rewrite_header_keeps_members() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        populate(&src);

        let (mut written, handle) = write(
            manifest("aaaa0005"),
            &source(&src),
            tmp.path(),
            None,
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        written.name = "renamed".to_string();
        let handle = rewrite_header(&handle, &written).unwrap();

        let (read_back, handle) = read(&handle.path).unwrap();
        assert_eq!(read_back.name, "renamed");
        extract(&handle, &read_back, None, &target(&out)).unwrap();
        assert!(out.join("configuration.yaml").exists());
    }

    #[test]
    fn test_read_rejects_foreign_tar() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("foreign.tar");
        {
            let mut builder = tar::Builder::new(File::create(&path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(3);
            header.set_cksum();
            builder.append_data(&mut header, "notes.txt", &b"hey"[..]).unwrap();
            builder.finish().unwrap();
        }
        assert!(matches!(read(&path).unwrap_err(), BackupError::CorruptArchive(_)));
    }

    #[test]
    fn test_read_rejects_escaping_addon_slug() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        populate(&src);

        let mut crafted = manifest("aaaa0006");
        crafted.content.addons.insert("../../share".to_string());
        let sources = vec![ArchiveSource {
            kind: SourceKind::Addon("../../share".into()),
            path: src.clone(),
            walk: WalkOptions::default(),
        }];
        let (_, handle) = write(
            crafted,
            &sources,
            tmp.path(),
            None,
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let err = read(&handle.path).unwrap_err();
        assert!(matches!(err, BackupError::CorruptArchive(ref m) if m.contains("../../share")));
    }

    #[test]
    fn test_colliding_member_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest");
        let src = tmp.path().join("src");
        populate(&src);
        fs::create_dir_all(&dest).unwrap();

        let sources: Vec<ArchiveSource> = ["a.b", "a_b"]
            .iter()
            .map(|id| ArchiveSource {
                kind: SourceKind::Folder(id.to_string()),
                path: src.clone(),
                walk: WalkOptions::default(),
            })
            .collect();
        let err = write(
            manifest("aaaa0007"),
            &sources,
            &dest,
            None,
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::InvalidOption(ref m) if m.contains("folder_a_b")));
        assert!(leftovers(&dest).is_empty());
    }

    #[test]
    fn test_extract_keeps_always_excluded_entries() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        populate(&src);

        let (written, handle) = write(
            manifest("aaaa0008"),
            &source(&src),
            tmp.path(),
            None,
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        fs::create_dir_all(out.join("__pycache__")).unwrap();
        fs::write(out.join("__pycache__/top.pyc"), b"top").unwrap();
        fs::create_dir_all(out.join("custom/__pycache__")).unwrap();
        fs::write(out.join("custom/__pycache__/deep.pyc"), b"deep").unwrap();
        fs::write(out.join("custom/stale.py"), b"old").unwrap();
        fs::create_dir_all(out.join("gone")).unwrap();

        extract(&handle, &written, None, &target(&out)).unwrap();
        assert_eq!(fs::read(out.join("__pycache__/top.pyc")).unwrap(), b"top");
        assert_eq!(fs::read(out.join("custom/__pycache__/deep.pyc")).unwrap(), b"deep");
        assert!(!out.join("custom/stale.py").exists());
        assert!(!out.join("gone").exists());
        assert!(out.join("nested/secrets.yaml").exists());
    }

    #[test]
    fn test_extract_validated_uses_unlocked_key() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        populate(&src);

        let (written, handle) = write(
            manifest("aaaa0009"),
            &source(&src),
            tmp.path(),
            Some("hunter2"),
            &WriteOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let key = validate(&handle, &written, Some("hunter2")).unwrap();
        assert!(key.is_some());
        check_targets(&handle, &written, &target(&out)).unwrap();
        extract_validated(&handle, &written, key.as_ref(), &target(&out)).unwrap();
        assert_eq!(
            fs::read(out.join("nested/secrets.yaml")).unwrap(),
            b"api_key: 1234\n"
        );

        let missing = vec![ExtractTarget {
            kind: SourceKind::Folder("share".into()),
            path: tmp.path().join("share"),
        }];
        let err = check_targets(&handle, &written, &missing).unwrap_err();
        assert!(matches!(err, BackupError::CorruptArchive(_)));
    }

    #[test]
    fn test_cleanup_temp_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".tmp-abc.tar"), b"partial").unwrap();
        fs::create_dir(tmp.path().join(".tmp-staging")).unwrap();
        fs::write(tmp.path().join("keep.tar"), b"done").unwrap();

        assert_eq!(cleanup_temp_files(tmp.path()).unwrap(), 2);
        assert_eq!(leftovers(tmp.path()), vec!["keep.tar"]);
    }
}
