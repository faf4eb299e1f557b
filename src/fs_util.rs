//! Filesystem primitives shared by every store.
//!
//! Writers never expose partial content: single-record files are written to
//! a unique sibling temp file and renamed over the target. Stream files are
//! appended one line at a time. Everything is created owner read/write only.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{tlog_trace, Error, Result};

/// Marker embedded in temp file names; directory scans skip these.
pub const TMP_MARKER: &str = ".tmp.";

/// Longest team or worker name accepted.
pub const MAX_NAME_LENGTH: usize = 64;

/// Write `content` to `path` atomically (temp file + rename).
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    {
        let mut file = open_owner_only(&tmp, false)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    set_owner_only(&tmp)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    tlog_trace!("atomic_write {} ({} bytes)", path.display(), content.len());
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut contents = serde_json::to_vec_pretty(value)?;
    contents.push(b'\n');
    atomic_write(path, &contents)
}

/// Read a whole-file JSON record. Missing and malformed files are both `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Append a single line (newline added) to a stream file.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = open_owner_only(path, true)?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    Ok(())
}

/// Serialize `value` as one JSON line and append it.
pub fn append_json_line<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    append_line(path, &serde_json::to_string(value)?)
}

/// Non-empty lines of a stream file. A missing file has no lines.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace a stream file with the given lines.
pub fn rewrite_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    atomic_write(path, content.as_bytes())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create a directory tree with owner-only permissions on the leaf.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Restrict a file to owner read/write.
pub fn set_owner_only(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn open_owner_only(path: &Path, append: bool) -> std::io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(
        "{}{}{}.{}",
        name,
        TMP_MARKER,
        std::process::id(),
        &nonce[..8]
    ))
}

/// Resolve `path` and fail if it is not contained in `base`.
///
/// Neither path needs to exist: the longest existing ancestor is
/// canonicalized (following symlinks) and the remainder is normalized
/// lexically.
pub fn validate_resolved_path(path: &Path, base: &Path) -> Result<PathBuf> {
    let resolved = resolve(path)?;
    let resolved_base = resolve(base)?;
    if resolved.starts_with(&resolved_base) {
        Ok(resolved)
    } else {
        Err(Error::PathEscape {
            path: resolved,
            base: resolved_base,
        })
    }
}

fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize(&absolute);

    let mut existing = normalized.as_path();
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

fn task_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"))
}

/// Validate a team or worker name against the allow-list.
pub fn sanitize_name<'a>(kind: &'static str, name: &'a str) -> Result<&'a str> {
    if name.len() > MAX_NAME_LENGTH || !name_pattern().is_match(name) {
        return Err(Error::InvalidName {
            kind,
            value: name.to_string(),
        });
    }
    Ok(name)
}

/// Validate a task id. Dots are allowed, but an id made only of dots is not.
pub fn sanitize_task_id(id: &str) -> Result<&str> {
    if !task_id_pattern().is_match(id) || id.chars().all(|c| c == '.') {
        return Err(Error::InvalidName {
            kind: "task ID",
            value: id.to_string(),
        });
    }
    Ok(id)
}
