// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plain-text files handed to the scheduler, credentials and trust collaborators

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::LocalState;
use crate::error::Result;

const HEADER: &str = "# Managed by barman-relay; local edits are overwritten\n";

/// Directories holding one rendered file per entry
const MANAGED_DIRS: &[&str] = &["barman.d", "authorized_keys"];

const PGPASS: &str = "pgpass";

/// Relative path to file contents
pub type RenderedFiles = BTreeMap<PathBuf, String>;

/// Render every output file for `state`
pub fn render(state: &LocalState) -> RenderedFiles {
    let mut files = RenderedFiles::new();

    for (name, server) in &state.servers {
        let description = server
            .description
            .clone()
            .unwrap_or_else(|| format!("PostgreSQL server {}", name));
        let contents = format!(
            "{}[{}]\ndescription = \"{}\"\nconninfo = {}\nssh_command = {}\n",
            HEADER, name, description, server.conninfo, server.ssh_command
        );
        files.insert(Path::new("barman.d").join(format!("{}.conf", name)), contents);
    }

    let mut crontab = String::from(HEADER);
    for entry in state.schedule.values() {
        let [monthday, weekday, hour, minute, command, user] = entry.fields();
        crontab.push_str(&format!(
            "{} {} {} * {} {} {}\n",
            minute, hour, monthday, weekday, user, command
        ));
    }
    files.insert(PathBuf::from("crontab"), crontab);

    let mut pgpass = String::new();
    for entry in state.credentials.values() {
        if !entry.has_secret() {
            warn!(title = %entry.title, "No secret collected this run, line left out");
            continue;
        }
        pgpass.push_str(&entry.line());
        pgpass.push('\n');
    }
    files.insert(PathBuf::from(PGPASS), pgpass);

    let mut by_user: BTreeMap<&str, String> = BTreeMap::new();
    for (title, entry) in &state.trusted_keys {
        let comment = entry.comment.as_deref().unwrap_or(title.as_str());
        by_user
            .entry(entry.user.as_str())
            .or_insert_with(|| String::from(HEADER))
            .push_str(&format!("{} {} {}\n", entry.key_type, entry.key, comment));
    }
    for (user, contents) in by_user {
        files.insert(Path::new("authorized_keys").join(user), contents);
    }

    files
}

/// Write rendered files below `dir`, touching only files whose content changed
pub fn write_rendered<P: AsRef<Path>>(dir: P, files: &RenderedFiles) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut written = Vec::new();

    for (relative, contents) in files {
        let path = dir.join(relative);
        if path.exists() && std::fs::read_to_string(&path)? == *contents {
            continue;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if relative.as_path() == Path::new(PGPASS) {
            write_private(&path, contents)?;
        } else {
            std::fs::write(&path, contents)?;
        }

        info!(path = %path.display(), "Rendered");
        written.push(path);
    }

    Ok(written)
}

/// Write a file only its owner can read, before any content lands in it
fn write_private(path: &Path, contents: &str) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);

    let mut file = options.open(path)?;
    // An existing file keeps its old mode on open
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Delete files in the per-entry directories below `dir` that `files` no longer contains
pub fn remove_stale<P: AsRef<Path>>(dir: P, files: &RenderedFiles) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut removed = Vec::new();

    for managed in MANAGED_DIRS {
        let managed_dir = dir.join(managed);
        if !managed_dir.is_dir() {
            continue;
        }

        for entry in std::fs::read_dir(&managed_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let relative = Path::new(managed).join(entry.file_name());
            if files.contains_key(&relative) {
                continue;
            }

            let path = entry.path();
            std::fs::remove_file(&path)?;
            info!(path = %path.display(), "Removed stale file");
            removed.push(path);
        }
    }

    Ok(removed)
}
