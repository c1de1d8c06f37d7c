//! Per-connection filesystem sandbox.
//!
//! Every path arriving on the wire is resolved against a root directory:
//! leading separators are stripped and `..` components are clamped at the
//! root, so no request can name anything outside the workspace. The file
//! operations exposed by the `fs/*` protocol actions live here.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::io::Seek;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("URL has no usable file name: {0}")]
    NoFileName(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

type Result<T> = std::result::Result<T, SandboxError>;

/// One non-recursive directory listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    /// If false, the path is a directory.
    pub isfile: bool,
    pub islink: bool,
}

/// `lstat` summary for the `fs/stat` action. Times are seconds.
#[derive(Debug, Clone, Serialize)]
pub struct StatInfo {
    pub size: u64,
    pub isfile: bool,
    pub ctime: f64,
    pub mtime: f64,
}

static SHOW_ANALYZER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^showAnalyzer\s+([A-Za-z0-9_.]+)\s*$").expect("static regex"));

/// Filesystem view rooted at a workspace directory.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Open a sandbox at `base`, optionally narrowed to a sub-path taken
    /// from the connection URL. The root directory is created on first use
    /// and survives across client sessions.
    pub async fn new(base: &Path, prefix: Option<&str>) -> Result<Self> {
        let mut sandbox = Self {
            root: base.to_path_buf(),
        };
        if let Some(prefix) = prefix {
            if !prefix.is_empty() {
                sandbox.root = sandbox.resolve(prefix);
            }
        }
        tokio::fs::create_dir_all(&sandbox.root).await?;
        Ok(sandbox)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a wire path inside the root. Leading separators are stripped
    /// and `..` never climbs above the root.
    pub fn resolve(&self, input: &str) -> PathBuf {
        let trimmed = input.trim_start_matches('/');
        let mut resolved = self.root.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    if resolved != self.root {
                        resolved.pop();
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        resolved
    }

    /// Non-recursive listing of a directory inside the sandbox.
    pub async fn list(&self, path: &str) -> Result<Vec<EntryInfo>> {
        let dir = self.resolve(path);
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            // is_file follows symlinks, mirroring what clients expect from
            // a directory browser; islink reports the link itself.
            let isfile = tokio::fs::metadata(entry.path())
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            entries.push(EntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                isfile,
                islink: file_type.is_symlink(),
            });
        }
        Ok(entries)
    }

    pub async fn mkdir(&self, path: &str) -> Result<PathBuf> {
        let dir = self.resolve(path);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn stat(&self, path: &str) -> Result<StatInfo> {
        let target = self.resolve(path);
        let meta = tokio::fs::symlink_metadata(&target).await?;
        Ok(StatInfo {
            size: meta.size(),
            isfile: !meta.is_dir(),
            ctime: meta.ctime() as f64 + meta.ctime_nsec() as f64 * 1e-9,
            mtime: meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9,
        })
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(path)).await?)
    }

    pub async fn upload(&self, path: &str, data: &[u8]) -> Result<PathBuf> {
        let target = self.resolve(path);
        tokio::fs::write(&target, data).await?;
        Ok(target)
    }

    /// Remove a file or a whole directory tree.
    pub async fn remove(&self, path: &str) -> Result<PathBuf> {
        let target = self.resolve(path);
        let meta = tokio::fs::symlink_metadata(&target).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(target)
    }

    pub async fn rename(&self, path: &str, new_path: &str) -> Result<(PathBuf, PathBuf)> {
        let from = self.resolve(path);
        let to = self.resolve(new_path);
        tokio::fs::rename(&from, &to).await?;
        Ok((from, to))
    }

    /// Copy a single file. Directories are rejected by the host.
    pub async fn copy(&self, path: &str, new_path: &str) -> Result<(PathBuf, PathBuf)> {
        let from = self.resolve(path);
        let to = self.resolve(new_path);
        tokio::fs::copy(&from, &to).await?;
        Ok((from, to))
    }

    /// Download a URL into the sandbox root, named after the URL's last
    /// path segment. `file://` URLs are copied locally.
    pub async fn fetch_from_url(&self, raw_url: &str) -> Result<PathBuf> {
        let url = Url::parse(raw_url)?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| SandboxError::NoFileName(raw_url.to_string()))?
            .to_string();
        let target = self.resolve(&name);
        let data = fetch_url_bytes(&url).await?;
        tokio::fs::write(&target, data).await?;
        debug!("Fetched {} into {}", raw_url, target.display());
        Ok(target)
    }

    /// Download a zip archive and extract it into the sandbox root. The
    /// intermediate file is removed on success and on failure.
    pub async fn download_extract_zip(&self, raw_url: &str) -> Result<PathBuf> {
        let url = Url::parse(raw_url)?;
        let data = fetch_url_bytes(&url).await?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || extract_zip(&data, &root)).await??;
        debug!("Extracted {} into {}", raw_url, self.root.display());
        Ok(self.root.clone())
    }

    /// Rewrite every `showAnalyzer <identifier>` line of a script so the
    /// analyzer output goes to a server socket terminal instead of a window.
    pub async fn replace_analyzer(&self, path: &str) -> Result<PathBuf> {
        let target = self.resolve(path);
        let contents = tokio::fs::read_to_string(&target).await?;
        let rewritten: Vec<String> = contents
            .split('\n')
            .map(|line| match SHOW_ANALYZER.captures(line) {
                Some(caps) => format!(
                    "emulation CreateServerSocketTerminal 29172 \"term\"; connector Connect {} term",
                    &caps[1]
                ),
                None => line.to_string(),
            })
            .collect();
        tokio::fs::write(&target, rewritten.join("\n")).await?;
        Ok(target)
    }
}

async fn fetch_url_bytes(url: &Url) -> Result<Vec<u8>> {
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| SandboxError::NoFileName(url.to_string()))?;
            Ok(tokio::fs::read(path).await?)
        }
        "http" | "https" => {
            let response = reqwest::get(url.clone()).await?.error_for_status()?;
            Ok(response.bytes().await?.to_vec())
        }
        other => Err(SandboxError::UnsupportedScheme(other.to_string())),
    }
}

/// Blocking zip extraction; the archive bytes stay in a temporary file that
/// is deleted when the guard drops, on every path.
fn extract_zip(data: &[u8], root: &Path) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut temp, data)?;
    temp.as_file_mut().rewind()?;
    let mut archive = zip::ZipArchive::new(temp.as_file_mut())?;
    archive.extract(root)?;
    Ok(())
}
