//! Single-file transport encodings for artifacts.
//!
//! Both formats wrap the artifact in one top-level entry named after the
//! artifact, so a bundle of a file and a bundle of a directory unpack the
//! same way (see [`crate::StagedArtifact::collapse_single_entry`]).

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::util::copy_cancellable;
use crate::CancelToken;

const ZSTD_LEVEL: i32 = 3;

/// Write `source` (file or directory) as a `tar.zst` stream under `entry_name`.
pub fn write_tar_zst(source: &Path, entry_name: &str, out: impl Write) -> Result<()> {
    let encoder = zstd::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    if source.is_dir() {
        builder.append_dir_all(entry_name, source)?;
    } else {
        builder.append_path_with_name(source, entry_name)?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Unpack a `tar.zst` stream into the directory `dest`.
///
/// Only regular files and directories with relative, `..`-free paths are
/// accepted.
pub fn unpack_tar_zst(input: impl Read, dest: &Path, cancel: &CancelToken) -> Result<()> {
    fs::create_dir_all(dest)?;
    let decoder = zstd::Decoder::new(input)?;
    let mut archive = tar::Archive::new(decoder);

    let mut entries_seen = 0usize;
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        validate_archive_relative_path(&entry_path)?;
        let out_path = dest.join(&entry_path);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out_path)?;
            }
            EntryType::Regular => {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&out_path)?;
                copy_cancellable(&mut entry, &mut out, cancel)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
                    }
                }
            }
            _ => {
                return Err(CacheError::UnsupportedArchiveEntryType { path: entry_path });
            }
        }
        entries_seen += 1;
    }

    if entries_seen == 0 {
        return Err(CacheError::EmptyArchive);
    }
    Ok(())
}

/// Write `source` (file or directory) as a zip archive under `entry_name`.
pub fn write_zip(source: &Path, entry_name: &str, out: impl Write + Seek) -> Result<()> {
    let mut zip = zip::ZipWriter::new(out);
    let options = zip::write::FileOptions::<()>::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    if source.is_dir() {
        for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| CacheError::InvalidArchivePath {
                    path: entry.path().to_path_buf(),
                })?;
            let name = archive_name(entry_name, rel);
            if entry.file_type().is_dir() {
                zip.add_directory(name, options)?;
                continue;
            }
            zip.start_file(name, options)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut zip)?;
        }
    } else {
        zip.start_file(entry_name, options)?;
        let mut file = File::open(source)?;
        io::copy(&mut file, &mut zip)?;
    }

    zip.finish()?;
    Ok(())
}

/// Unpack a zip archive into `dest`. Entry CRCs are verified while reading.
pub fn unpack_zip(input: impl Read + Seek, dest: &Path, cancel: &CancelToken) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = zip::ZipArchive::new(input)?;
    if archive.len() == 0 {
        return Err(CacheError::EmptyArchive);
    }

    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let mut file = archive.by_index(index)?;
        let raw_name = PathBuf::from(file.name());
        let Some(rel) = file.enclosed_name() else {
            return Err(CacheError::InvalidArchivePath { path: raw_name });
        };
        validate_archive_relative_path(&rel)?;
        let out_path = dest.join(&rel);

        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if !file.is_file() {
            return Err(CacheError::UnsupportedArchiveEntryType { path: raw_name });
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        copy_cancellable(&mut file, &mut out, cancel)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
    }
    Ok(())
}

fn archive_name(entry_name: &str, rel: &Path) -> String {
    let mut name = entry_name.to_owned();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            name.push('/');
            name.push_str(&part.to_string_lossy());
        }
    }
    name
}

pub(crate) fn validate_archive_relative_path(path: &Path) -> Result<()> {
    let mut has_normal = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            _ => {
                return Err(CacheError::InvalidArchivePath {
                    path: path.to_path_buf(),
                })
            }
        }
    }
    if !has_normal {
        return Err(CacheError::InvalidArchivePath {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
