//! Discovery module: find the .vidsearch root and the files inside it

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::{Result, VS_DIR, VsError};

/// Find the .vidsearch root directory by walking up from the given path.
///
/// Returns the path to the directory containing .vidsearch (not the folder itself).
pub fn find_vs_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.canonicalize()?;

    loop {
        let vs_path = current.join(VS_DIR);
        if vs_path.is_dir() {
            return Ok(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Err(VsError::NotInRepo),
        }
    }
}

/// Get the .vidsearch directory path for a given root.
pub fn vs_dir(root: &Path) -> PathBuf {
    root.join(VS_DIR)
}

/// Get the config file path.
pub fn config_path(root: &Path) -> PathBuf {
    vs_dir(root).join("config.json")
}

/// Get the vector index snapshot path.
pub fn index_path(root: &Path) -> PathBuf {
    vs_dir(root).join("index.bin")
}

/// Get the metadata ledger path.
pub fn ledger_path(root: &Path) -> PathBuf {
    vs_dir(root).join("ledger.json")
}

/// Get the thumbnail directory path.
pub fn thumbnails_dir(root: &Path) -> PathBuf {
    vs_dir(root).join("thumbnails")
}

/// Get the scratch directory path.
pub fn tmp_dir(root: &Path) -> PathBuf {
    vs_dir(root).join("tmp")
}

/// List video files under `dir` whose extension is in `extensions`.
///
/// Hidden files and partially downloaded files are skipped; the result is
/// sorted so builds visit assets in a stable order.
pub fn find_assets(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let walker = WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    let mut assets: Vec<PathBuf> = walker
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext)
        })
        .collect();

    assets.sort();
    assets
}
