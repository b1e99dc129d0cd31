//! Cache of workspace files quoted into Q&A context.
//!
//! Questions often name files ("what does src/auth/session.rs expose?").
//! The orchestrator reads those files once and serves later questions from
//! memory until the file's mtime changes.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, PoisonError, RwLock};
use std::time::{Instant, SystemTime};

use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Entries kept before the oldest-loaded one is evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// How deep bare file names are searched for.
pub const DEFAULT_WALK_DEPTH: usize = 6;

/// Directories never searched for bare file names.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv", "dist", "build"];

static PATH_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s`'"(\[])((?:[\w.-]+/)*[\w.-]+\.(?:rs|py|tsx|ts|jsx|js|go|java|kt|swift|rb|cpp|hpp|c|h|toml|yaml|yml|json|md|sql|sh|html|css))\b"#,
    )
    .ok()
});

/// SHA-256 of file content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_content(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Reloads caused by an mtime change.
    pub invalidations: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`, or 0.0 before any access.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content: String,
    hash: ContentHash,
    modified: Option<SystemTime>,
    loaded_at: Instant,
}

/// A file as served by the cache.
#[derive(Debug, Clone)]
pub struct CachedFile {
    /// Path relative to the workspace root.
    pub path: PathBuf,
    pub content: String,
    pub hash: ContentHash,
    pub from_cache: bool,
}

/// Relative paths with a known source extension mentioned in `text`, in
/// order of first mention.
pub fn referenced_paths(text: &str) -> Vec<String> {
    let Some(pattern) = PATH_PATTERN.as_ref() else {
        return Vec::new();
    };
    let mut seen = Vec::new();
    for caps in pattern.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            let path = m.as_str().to_string();
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
    }
    seen
}

/// Path-keyed cache of file contents under one workspace root.
pub struct FileCache {
    root: PathBuf,
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    stats: RwLock<CacheStats>,
    max_entries: usize,
    walk_depth: usize,
}

impl FileCache {
    /// # Errors
    ///
    /// Fails if `root` cannot be canonicalized.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            max_entries: DEFAULT_MAX_ENTRIES,
            walk_depth: DEFAULT_WALK_DEPTH,
        })
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a mention to an absolute path inside the root.
    ///
    /// Mentions containing a separator are joined to the root; bare names
    /// are searched for. Returns `None` for missing files and for anything
    /// that resolves outside the root.
    pub fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        let candidate = Path::new(reference);
        if candidate.is_absolute() {
            return None;
        }

        let found = if candidate.components().count() > 1 {
            self.root.join(candidate)
        } else {
            self.find_by_name(reference)?
        };

        let canonical = found.canonicalize().ok()?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!(reference = %reference, "Rejecting path outside workspace root");
            return None;
        }
        canonical.is_file().then_some(canonical)
    }

    fn find_by_name(&self, name: &str) -> Option<PathBuf> {
        WalkDir::new(&self.root)
            .max_depth(self.walk_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let dir = entry.file_name().to_string_lossy();
                !dir.starts_with('.') && !SKIPPED_DIRS.contains(&dir.as_ref())
            })
            .filter_map(Result::ok)
            .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
            .map(|entry| entry.into_path())
    }

    /// Reads an absolute path inside the root, from cache when the mtime
    /// has not changed.
    ///
    /// # Errors
    ///
    /// I/O errors from stat or read, and `InvalidInput` for paths outside
    /// the root.
    pub fn read(&self, path: &Path) -> std::io::Result<CachedFile> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path outside workspace root")
            })?
            .to_path_buf();
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path outside workspace root",
            ));
        }
        let modified = std::fs::metadata(path)?.modified().ok();

        let mut stale = false;
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(path) {
                if entry.modified == modified {
                    self.bump(|s| s.hits += 1);
                    return Ok(CachedFile {
                        path: relative,
                        content: entry.content.clone(),
                        hash: entry.hash.clone(),
                        from_cache: true,
                    });
                }
                stale = true;
            }
        }

        let content = std::fs::read_to_string(path)?;
        let hash = ContentHash::from_content(&content);
        self.bump(|s| {
            s.misses += 1;
            if stale {
                s.invalidations += 1;
            }
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(path) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.loaded_at)
                .map(|(p, _)| p.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.bump(|s| s.evictions += 1);
            }
        }
        entries.insert(
            path.to_path_buf(),
            CacheEntry {
                content: content.clone(),
                hash: hash.clone(),
                modified,
                loaded_at: Instant::now(),
            },
        );
        tracing::debug!(path = %relative.display(), hash = %hash, "Loaded file into cache");

        Ok(CachedFile {
            path: relative,
            content,
            hash,
            from_cache: false,
        })
    }

    fn bump(&self, f: impl FnOnce(&mut CacheStats)) {
        f(&mut self.stats.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Renders every file referenced in `text` as fenced blocks, stopping
    /// at `max_bytes`. The last file is truncated on a char boundary.
    pub fn context_for(&self, text: &str, max_bytes: usize) -> String {
        let mut out = String::new();
        for reference in referenced_paths(text) {
            let Some(path) = self.resolve(&reference) else {
                continue;
            };
            let file = match self.read(&path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read referenced file");
                    continue;
                }
            };

            let header = format!("### {}\n```\n", file.path.display());
            let footer = "\n```\n\n";
            let room = max_bytes.saturating_sub(out.len() + header.len() + footer.len());
            if room == 0 {
                break;
            }
            out.push_str(&header);
            if file.content.len() <= room {
                out.push_str(&file.content);
                out.push_str(footer);
            } else {
                let mut cut = room;
                while !file.content.is_char_boundary(cut) {
                    cut -= 1;
                }
                out.push_str(&file.content[..cut]);
                out.push_str(footer);
                break;
            }
        }
        out
    }
}
