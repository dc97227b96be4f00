use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CacheError, Result};
use crate::{CancelToken, LOG_TARGET};

const URL_REDACTION: &str = "<redacted>";
const ASIDE_MARKER: &str = ".old.";

pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: LOG_TARGET,
                    error = %err,
                    "system time is before unix epoch; using 0 for now_millis"
                );
            }
            0
        }
    }
}

static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `{pid}.{counter}`: unique within this machine for the life of the process.
pub(crate) fn unique_suffix() -> String {
    let counter = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}.{counter}", std::process::id())
}

/// Write `path` through a sibling temp file and a rename so readers only ever
/// see the old contents or the complete new contents.
pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<()>,
) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<()> {
        write(&mut file)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        drop(file);
        remove_file_best_effort(&tmp_path, "atomic_write_with.write_failed");
        return Err(err);
    }
    drop(file);

    match rename_replacing(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent, "atomic_write_with.sync_parent_dir");
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write_with.rename_failed");
            Err(CacheError::from(err))
        }
    }
}

/// Rename `from` onto `to`, replacing whatever `to` currently is.
///
/// Concurrent writers of the same destination race; the last rename wins.
pub(crate) fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 64;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            // Windows never overwrites on rename, and no platform renames over
            // a non-empty directory. Move the old entry aside and retry.
            Err(err)
                if err.kind() != io::ErrorKind::NotFound && fs::symlink_metadata(to).is_ok() =>
            {
                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
                let aside = aside_path(to)?;
                match fs::rename(to, &aside) {
                    Ok(()) => remove_path_best_effort(&aside, "rename_replacing.aside"),
                    Err(aside_err) if aside_err.kind() == io::ErrorKind::NotFound => {}
                    Err(_) => remove_path_best_effort(to, "rename_replacing.in_place"),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Hidden sibling of `to` that an old entry is moved to before replacement.
/// Dot-prefixed names are never reported as cache entries.
pub(crate) fn aside_path(to: &Path) -> io::Result<PathBuf> {
    let Some(file_name) = to.file_name() else {
        return Err(io::Error::other("destination path has no file name"));
    };
    let mut aside = std::ffi::OsString::from(".");
    aside.push(file_name);
    aside.push(ASIDE_MARKER);
    aside.push(unique_suffix());
    Ok(to.with_file_name(aside))
}

/// Whether `file_name` was produced by [`aside_path`].
pub(crate) fn is_aside_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.contains(ASIDE_MARKER)
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target: LOG_TARGET,
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Remove a file, symlink, or directory tree.
pub(crate) fn remove_path_best_effort(path: &Path, reason: &'static str) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(
                target: LOG_TARGET,
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache path"
            );
        }
    }
}

/// Flush a directory entry after a rename. Unix only; failures are logged once.
pub(crate) fn sync_dir_best_effort(dir: &Path, reason: &'static str) {
    #[cfg(unix)]
    if let Err(err) = fs::File::open(dir).and_then(|dir| dir.sync_all()) {
        static LOGGED: OnceLock<()> = OnceLock::new();
        if err.kind() != io::ErrorKind::NotFound && LOGGED.set(()).is_ok() {
            tracing::debug!(
                target: LOG_TARGET,
                dir = %dir.display(),
                reason,
                error = %err,
                "directory sync failed"
            );
        }
    }

    #[cfg(not(unix))]
    let _ = (dir, reason);
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;

    loop {
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{}", unique_suffix()));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Copy `reader` into `writer`, checking `cancel` between chunks.
pub fn copy_cancellable(
    reader: &mut (impl Read + ?Sized),
    writer: &mut (impl Write + ?Sized),
    cancel: &CancelToken,
) -> Result<u64> {
    let mut buf = vec![0_u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buf[..read])?;
        copied += read as u64;
    }
    writer.flush()?;
    Ok(copied)
}

/// Render a URL for logs and errors with userinfo and query values redacted.
///
/// Download URLs are often pre-signed and carry credentials in the query.
pub fn sanitize_url(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return url.to_owned(),
    };
    let (rest, fragment) = match rest.split_once('#') {
        Some((rest, _)) => (rest, Some(URL_REDACTION)),
        None => (rest, None),
    };
    let (location, query) = match rest.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (rest, None),
    };
    let (authority, path) = location.split_at(location.find('/').unwrap_or(location.len()));
    let host = authority.rsplit_once('@').map(|(_, host)| host);

    let mut out = format!("{scheme}://");
    if let Some(host) = host {
        out.push_str(URL_REDACTION);
        out.push('@');
        out.push_str(host);
    } else {
        out.push_str(authority);
    }
    out.push_str(path);
    if let Some(query) = query {
        let redacted: Vec<String> = query
            .split('&')
            .map(|pair| match pair.split_once('=').map_or(pair, |(key, _)| key) {
                "" => String::new(),
                key => format!("{key}={URL_REDACTION}"),
            })
            .collect();
        out.push('?');
        out.push_str(&redacted.join("&"));
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
