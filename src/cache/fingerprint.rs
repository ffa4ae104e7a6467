use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Sentinel fingerprint when the project scan fails; always treated as a
/// cache miss.
pub const UNKNOWN_PROJECT: &str = "unknown";

/// Scan ceiling — the digest covers at most this many files.
pub const MAX_SCAN_FILES: usize = 50;

/// Extensions that participate in the project fingerprint.
const SCAN_EXTENSIONS: &[&str] = &[
    "rs", "js", "ts", "tsx", "py", "go", "java", "c", "h", "cpp", "json", "toml", "yaml", "yml",
    "md",
];

/// Directories that never participate in the scan.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    ".venv",
    "__pycache__",
    ".idea",
    ".vscode",
];

/// Lowercase and collapse internal whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Count of non-whitespace characters, the "significant length" used by
/// pre-flight validation.
pub fn significant_len(question: &str) -> usize {
    question.chars().filter(|c| !c.is_whitespace()).count()
}

/// Content-addressing key for one deliberation. The roster is sorted before
/// hashing so permutations of the same alias set share an entry.
pub fn debate_fingerprint(
    question: &str,
    category: &str,
    roster_aliases: &[String],
    project_fingerprint: &str,
) -> String {
    let mut sorted = roster_aliases.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(normalize_question(question).as_bytes());
    hasher.update(b"|");
    hasher.update(category.as_bytes());
    hasher.update(b"|");
    hasher.update(sorted.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(project_fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of a bounded project scan: up to [`MAX_SCAN_FILES`] whitelisted
/// files, `(mtime_ms, size)` tuples concatenated in ascending path order.
/// Returns [`UNKNOWN_PROJECT`] when the directory cannot be read.
pub async fn project_fingerprint(root: &Path) -> String {
    project_fingerprint_bounded(root, MAX_SCAN_FILES).await
}

pub async fn project_fingerprint_bounded(root: &Path, max_files: usize) -> String {
    let mut files = match collect_files(root).await {
        Ok(files) => files,
        Err(e) => {
            tracing::debug!(root = %root.display(), "project scan failed: {e}");
            return UNKNOWN_PROJECT.to_string();
        }
    };
    files.sort();
    files.truncate(max_files);

    let mut hasher = Sha256::new();
    for path in files {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return UNKNOWN_PROJECT.to_string();
        };
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(mtime_ms.to_le_bytes());
        hasher.update(meta.len().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Iterative directory walk (no recursion, no async stack growth) honoring
/// the skip list and extension whitelist.
async fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !SKIP_DIRS.contains(&name.as_ref()) && !name.starts_with('.') {
                    pending.push(path);
                }
            } else if file_type.is_file()
                && let Some(ext) = path.extension().and_then(|e| e.to_str())
                && SCAN_EXTENSIONS.contains(&ext)
            {
                found.push(path);
            }
        }
    }
    Ok(found)
}
