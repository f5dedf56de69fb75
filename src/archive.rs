//! Layer tarballs: computing differences between trees and applying them
//!
//! Layers use OCI whiteouts for deletions: removing `a/b` is recorded as an
//! empty `a/.wh.b` entry, and `a/.wh..wh..opq` clears everything under `a`
//! that came from lower layers. Tarballs are canonical (sorted entries, zero
//! mtimes and owners) so the same tree pair always yields the same bytes.

use crate::compression::Compression;
use crate::digest::Digest;
use crate::error::{CacheError, CacheResult};
use crate::snapshot::{mount_path, Mount};
use async_trait::async_trait;
use std::fs::{self, File, Metadata};
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use tar::{EntryType, Header};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Computes an uncompressed layer tarball between two mounted trees
#[async_trait]
pub trait Differ: Send + Sync {
    /// Layer turning `lower` into `upper`
    ///
    /// A missing `upper` produces a layer that deletes everything in `lower`.
    async fn compare(
        &self,
        lower: Option<&[Mount]>,
        upper: Option<&[Mount]>,
    ) -> CacheResult<Vec<u8>>;
}

/// Applies a (possibly compressed) layer tarball onto a mounted tree
#[async_trait]
pub trait Applier: Send + Sync {
    /// Returns the digest of the uncompressed tarball
    ///
    /// Stops with `Cancelled` between entries once `cancel` fires; the
    /// returned future only resolves after all writes to `target` stopped.
    async fn apply(
        &self,
        target: &[Mount],
        layer: Vec<u8>,
        compression: Compression,
        cancel: &CancellationToken,
    ) -> CacheResult<Digest>;
}

/// Differ and applier working directly on bind-mounted directories
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveDiffer;

#[async_trait]
impl Differ for ArchiveDiffer {
    async fn compare(
        &self,
        lower: Option<&[Mount]>,
        upper: Option<&[Mount]>,
    ) -> CacheResult<Vec<u8>> {
        let lower = lower.map(mount_path).transpose()?.map(Path::to_path_buf);
        let upper = upper.map(mount_path).transpose()?.map(Path::to_path_buf);
        blocking(move || diff_dirs(lower.as_deref(), upper.as_deref())).await
    }
}

#[async_trait]
impl Applier for ArchiveDiffer {
    async fn apply(
        &self,
        target: &[Mount],
        layer: Vec<u8>,
        compression: Compression,
        cancel: &CancellationToken,
    ) -> CacheResult<Digest> {
        let target = mount_path(target)?.to_path_buf();
        let cancel = cancel.clone();
        blocking(move || apply_layer(&target, &layer, compression, &cancel)).await
    }
}

async fn blocking<T, F>(f: F) -> CacheResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CacheResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Internal(format!("archive task failed: {}", e)))?
}

fn walk_sorted(root: &Path) -> walkdir::IntoIter {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
}

fn relative(root: &Path, path: &Path) -> CacheResult<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| CacheError::Internal(format!("{} escapes {}", path.display(), root.display())))
}

fn walk_err(e: walkdir::Error) -> CacheError {
    let context = format!(
        "walking {}",
        e.path().map(|p| p.display().to_string()).unwrap_or_default()
    );
    CacheError::archive(context, e.into())
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn same_entry(lower: &Path, lower_meta: &Metadata, upper: &Path, upper_meta: &Metadata) -> CacheResult<bool> {
    let (lt, ut) = (lower_meta.file_type(), upper_meta.file_type());
    if lt.is_dir() != ut.is_dir() || lt.is_symlink() != ut.is_symlink() || lt.is_file() != ut.is_file() {
        return Ok(false);
    }
    if mode_of(lower_meta) != mode_of(upper_meta) {
        return Ok(false);
    }
    if ut.is_dir() {
        return Ok(true);
    }
    if ut.is_symlink() {
        let a = fs::read_link(lower).map_err(|e| CacheError::archive("reading symlink", e))?;
        let b = fs::read_link(upper).map_err(|e| CacheError::archive("reading symlink", e))?;
        return Ok(a == b);
    }
    if lower_meta.len() != upper_meta.len() {
        return Ok(false);
    }
    let a = fs::read(lower).map_err(|e| CacheError::archive(format!("reading {}", lower.display()), e))?;
    let b = fs::read(upper).map_err(|e| CacheError::archive(format!("reading {}", upper.display()), e))?;
    Ok(a == b)
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &Path,
    rel: &Path,
    meta: &Metadata,
) -> CacheResult<()> {
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode_of(meta));
    let file_type = meta.file_type();
    let err = |e| CacheError::archive(format!("adding {} to layer", rel.display()), e);
    if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, rel, std::io::empty()).map_err(err)?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(err)?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, rel, &target).map_err(err)?;
    } else if file_type.is_file() {
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        let file = File::open(path).map_err(err)?;
        builder.append_data(&mut header, rel, file).map_err(err)?;
    } else {
        debug!("Skipping special file {} in layer", path.display());
    }
    Ok(())
}

fn append_whiteout(builder: &mut tar::Builder<Vec<u8>>, rel: &Path) -> CacheResult<()> {
    let name = rel
        .file_name()
        .ok_or_else(|| CacheError::Internal(format!("whiteout for {}", rel.display())))?;
    let mut wh_name = std::ffi::OsString::from(WHITEOUT_PREFIX);
    wh_name.push(name);
    let wh = rel.with_file_name(wh_name);

    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    builder
        .append_data(&mut header, &wh, std::io::empty())
        .map_err(|e| CacheError::archive(format!("adding whiteout {}", wh.display()), e))
}

/// Build an uncompressed tarball that turns `lower` into `upper`
///
/// Either side may be absent, standing for an empty tree.
pub fn diff_dirs(lower: Option<&Path>, upper: Option<&Path>) -> CacheResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    if let Some(upper) = upper {
        for entry in walk_sorted(upper) {
            let entry = entry.map_err(walk_err)?;
            let rel = relative(upper, entry.path())?;
            let meta = entry.metadata().map_err(walk_err)?;
            if let Some(lower) = lower {
                let lower_path = lower.join(&rel);
                if let Ok(lower_meta) = fs::symlink_metadata(&lower_path) {
                    if same_entry(&lower_path, &lower_meta, entry.path(), &meta)? {
                        continue;
                    }
                }
            }
            append_entry(&mut builder, entry.path(), &rel, &meta)?;
        }
    }

    if let Some(lower) = lower {
        let mut it = walk_sorted(lower);
        while let Some(entry) = it.next() {
            let entry = entry.map_err(walk_err)?;
            let rel = relative(lower, entry.path())?;
            let upper_meta = match upper.map(|u| fs::symlink_metadata(u.join(&rel))) {
                None => None,
                Some(Ok(meta)) => Some(meta),
                Some(Err(e)) if e.kind() == ErrorKind::NotFound => None,
                Some(Err(e)) => {
                    return Err(CacheError::archive(format!("stat {}", rel.display()), e))
                }
            };
            match upper_meta {
                None => {
                    append_whiteout(&mut builder, &rel)?;
                    if entry.file_type().is_dir() {
                        it.skip_current_dir();
                    }
                }
                // Replaced by a non-directory; the upper entry overwrites it whole
                Some(meta) if entry.file_type().is_dir() && !meta.is_dir() => {
                    it.skip_current_dir();
                }
                Some(_) => {}
            }
        }
    }

    builder
        .into_inner()
        .map_err(|e| CacheError::archive("finishing layer", e))
}

/// Reject absolute paths and `..` components
fn safe_relative(path: &Path) -> CacheResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CacheError::archive(
                    format!("layer entry {} escapes the target", path.display()),
                    std::io::Error::from(ErrorKind::InvalidData),
                ))
            }
        }
    }
    Ok(out)
}

/// Refuse to write through symlinked directories inside the target
fn check_ancestors(target: &Path, rel: &Path) -> CacheResult<()> {
    let mut current = target.to_path_buf();
    if let Some(parent) = rel.parent() {
        for component in parent.components() {
            current.push(component);
            if let Ok(meta) = fs::symlink_metadata(&current) {
                if meta.file_type().is_symlink() {
                    return Err(CacheError::archive(
                        format!("layer entry {} traverses a symlink", rel.display()),
                        std::io::Error::from(ErrorKind::InvalidData),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_dir(path: &Path) -> std::io::Result<()> {
    match fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries {
                remove_path(&entry?.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply a layer onto `target`, returning the uncompressed digest
///
/// `cancel` is checked before every entry. Entries already written stay in
/// `target`.
pub fn apply_layer(
    target: &Path,
    layer: &[u8],
    compression: Compression,
    cancel: &CancellationToken,
) -> CacheResult<Digest> {
    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }
    let tarball = compression.decode(layer)?;
    let digest = Digest::from_bytes(&tarball);

    let mut archive = tar::Archive::new(tarball.as_slice());
    archive.set_preserve_permissions(true);
    let entries = archive
        .entries()
        .map_err(|e| CacheError::archive("reading layer entries", e))?;
    for entry in entries {
        if cancel.is_cancelled() {
            debug!("Layer apply onto {} cancelled", target.display());
            return Err(CacheError::Cancelled);
        }
        let mut entry = entry.map_err(|e| CacheError::archive("reading layer entry", e))?;
        let raw = entry
            .path()
            .map_err(|e| CacheError::archive("decoding entry path", e))?
            .into_owned();
        let rel = safe_relative(&raw)?;
        let Some(name) = rel.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        check_ancestors(target, &rel)?;
        let dest = target.join(&rel);
        let err = |e| CacheError::archive(format!("applying {}", rel.display()), e);

        if name == OPAQUE_WHITEOUT {
            if let Some(parent) = dest.parent() {
                clear_dir(parent).map_err(err)?;
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&dest.with_file_name(hidden)).map_err(err)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(err)?;
        }
        let is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = fs::symlink_metadata(&dest) {
            if !(is_dir && existing.is_dir()) {
                remove_path(&dest).map_err(err)?;
            }
        }
        entry.unpack(&dest).map_err(err)?;
    }

    Ok(digest)
}

/// Recursively copy a tree, preserving symlinks and permissions
pub fn copy_tree(src: &Path, dst: &Path) -> CacheResult<()> {
    fs::create_dir_all(dst).map_err(|e| CacheError::io(format!("creating {}", dst.display()), e))?;
    for entry in walk_sorted(src) {
        let entry = entry.map_err(walk_err)?;
        let rel = relative(src, entry.path())?;
        let to = dst.join(&rel);
        let err = |e| CacheError::io(format!("copying {}", rel.display()), e);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&to).map_err(err)?;
            let meta = entry.metadata().map_err(walk_err)?;
            fs::set_permissions(&to, meta.permissions()).map_err(err)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(err)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to).map_err(err)?;
            #[cfg(not(unix))]
            debug!("Skipping symlink {} -> {}", rel.display(), target.display());
        } else if file_type.is_file() {
            fs::copy(entry.path(), &to).map_err(err)?;
        }
    }
    Ok(())
}

/// Total file bytes and entry count under `root`
pub fn dir_usage(root: &Path) -> CacheResult<(u64, u64)> {
    let mut size = 0;
    let mut inodes = 0;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(walk_err)?;
        inodes += 1;
        if entry.file_type().is_file() {
            size += entry.metadata().map_err(walk_err)?.len();
        }
    }
    Ok((size, inodes))
}

/// Read a file from a tree, for tests and debugging
pub fn read_file(root: &Path, rel: &str) -> CacheResult<Vec<u8>> {
    let path = root.join(safe_relative(Path::new(rel))?);
    let mut buf = Vec::new();
    File::open(&path)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .map_err(|e| CacheError::io(format!("reading {}", path.display()), e))?;
    Ok(buf)
}
