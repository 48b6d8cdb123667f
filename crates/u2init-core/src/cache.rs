use log::debug;
use retry::{OperationResult, delay::Fibonacci, retry};
use sha2::{Digest, Sha224};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Download returned an empty body")]
    Empty,
    #[error("File I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fetches the body of a URL into a writer, returning the byte count.
pub trait Downloader: Send + Sync {
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64, DownloadError>;
}

/// Plain HTTP GET through `ureq`, body streamed straight to `dest`.
#[derive(Debug, Clone)]
pub struct UreqDownloader {
    agent: ureq::Agent,
    retries: usize,
}

impl UreqDownloader {
    #[must_use]
    pub fn new(timeout: Duration, retries: usize) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            retries,
        }
    }
}

impl Downloader for UreqDownloader {
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64, DownloadError> {
        debug!("downloading file from {url}");

        // Only the request is retried: once bytes hit `dest` there is no going back.
        let response = retry(Fibonacci::from_millis(100).take(self.retries), || {
            match self.agent.get(url).call() {
                Ok(response) => OperationResult::Ok(response),
                Err(ureq::Error::Status(429, _)) => OperationResult::Retry(DownloadError::Status(429)),
                Err(ureq::Error::Status(code, _)) => OperationResult::Err(DownloadError::Status(code)),
                Err(e) => OperationResult::Retry(DownloadError::Network(e.to_string())),
            }
        })
        .map_err(|e| e.error)?;

        if response.status() != 200 {
            return Err(DownloadError::Status(response.status()));
        }
        Ok(io::copy(&mut response.into_reader(), dest)?)
    }
}

/// A cache entry, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub source_url: String,
    pub cache_key: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

/// Hex SHA-224 of the URL; names the entry's directory.
#[must_use]
pub fn cache_key(url: &str) -> String {
    format!("{:x}", Sha224::digest(url.as_bytes()))
}

/// Last path segment of `url`, without query or fragment.
#[must_use]
pub fn url_basename(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => "download",
    }
}

/// Content-addressed store: `<root>/<sha224(url)>/<filename>`.
///
/// An entry is valid iff the file exists and is not empty.
/// Contents are never checked against anything else.
pub struct ContentCache {
    root: PathBuf,
    downloader: Arc<dyn Downloader>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ContentCache {
    #[must_use]
    pub fn new(root: PathBuf, downloader: Arc<dyn Downloader>) -> Self {
        Self { root, downloader }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, url: &str, filename: Option<&str>) -> PathBuf {
        self.root
            .join(cache_key(url))
            .join(filename.unwrap_or_else(|| url_basename(url)))
    }

    /// The entry for `url`, if it is valid.
    #[must_use]
    pub fn lookup(&self, url: &str, filename: Option<&str>) -> Option<CachedArtifact> {
        let local_path = self.path_for(url, filename);
        let size_bytes = fs::metadata(&local_path).ok().filter(|m| m.is_file())?.len();
        (size_bytes > 0).then(|| CachedArtifact {
            source_url: url.to_string(),
            cache_key: cache_key(url),
            local_path,
            size_bytes,
        })
    }

    /// Path of a valid local copy of `url`, downloading it on a miss.
    ///
    /// The body is streamed into `<file>.part` and renamed into place once
    /// complete; a failed transfer leaves no entry behind.
    pub fn fetch(&self, url: &str, filename: Option<&str>) -> Result<PathBuf, DownloadError> {
        if let Some(hit) = self.lookup(url, filename) {
            debug!("file '{}' cached before", hit.local_path.display());
            return Ok(hit.local_path);
        }

        let path = self.path_for(url, filename);
        let Some(dir) = path.parent() else {
            return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
        };
        fs::create_dir_all(dir)?;

        let mut part_name = path.file_name().unwrap_or_default().to_os_string();
        part_name.push(".part");
        let part = path.with_file_name(part_name);

        debug!("download from {url}");
        match self.download_to(url, &part) {
            Ok(0) => {
                let _ = fs::remove_file(&part);
                Err(DownloadError::Empty)
            }
            Ok(size) => {
                rename(&part, &path)?;
                debug!("cached {size} bytes at {}", path.display());
                Ok(path)
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                Err(e)
            }
        }
    }

    fn download_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let mut file = BufWriter::new(fs::File::create(dest)?);
        let size = self.downloader.download(url, &mut file)?;
        file.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()?;
        Ok(size)
    }
}

/// `fs::rename`, retried while something (an antivirus, an indexer) holds the file.
fn rename(from: &Path, to: &Path) -> io::Result<()> {
    retry(Fibonacci::from_millis(1).take(21), || match fs::rename(from, to) {
        Ok(()) => OperationResult::Ok(()),
        Err(e) => match e.kind() {
            io::ErrorKind::PermissionDenied => OperationResult::Retry(e),
            _ => OperationResult::Err(e),
        },
    })
    .map_err(|e| e.error)
}

#[allow(clippy::unwrap_used, reason = "tests")]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDownloader, HttpStub, http_response};

    const URL: &str = "https://github.com/openatx/android-uiautomator-server/releases/download/1.0.5/app-uiautomator.apk";

    fn cache_with(downloader: &Arc<FakeDownloader>) -> (tempfile::TempDir, ContentCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path().to_path_buf(), downloader.clone());
        (dir, cache)
    }

    #[test]
    fn key_is_sha224_hex() {
        let key = cache_key(URL);
        assert_eq!(key.len(), 56);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(key, cache_key(URL));
        assert_ne!(key, cache_key("https://example.com/other.apk"));
    }

    #[test]
    fn basename_of_url() {
        assert_eq!(url_basename(URL), "app-uiautomator.apk");
        assert_eq!(url_basename("https://h/x/minicap.so?raw=true"), "minicap.so");
        assert_eq!(url_basename("https://h/x/"), "download");
    }

    #[test]
    fn layout_is_root_hash_filename() {
        let fake = Arc::new(FakeDownloader::serving(b"apk"));
        let (dir, cache) = cache_with(&fake);
        assert_eq!(
            cache.path_for(URL, None),
            dir.path().join(cache_key(URL)).join("app-uiautomator.apk")
        );
        assert_eq!(
            cache.path_for(URL, Some("custom.apk")),
            dir.path().join(cache_key(URL)).join("custom.apk")
        );
    }

    #[test]
    fn second_fetch_is_a_cache_hit() {
        let fake = Arc::new(FakeDownloader::serving(b"apk-bytes"));
        let (_dir, cache) = cache_with(&fake);

        let first = cache.fetch(URL, None).unwrap();
        let second = cache.fetch(URL, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(fake.transfers(), 1);
        assert_eq!(fs::read(&first).unwrap(), b"apk-bytes");
    }

    #[test]
    fn deleted_entry_is_downloaded_again() {
        let fake = Arc::new(FakeDownloader::serving(b"apk-bytes"));
        let (_dir, cache) = cache_with(&fake);

        let path = cache.fetch(URL, None).unwrap();
        assert_eq!(fake.transfers(), 1);
        fs::remove_file(&path).unwrap();
        assert!(cache.lookup(URL, None).is_none());

        assert_eq!(cache.fetch(URL, None).unwrap(), path);
        assert_eq!(fake.transfers(), 2);
    }

    #[test]
    fn empty_entry_is_never_trusted() {
        let fake = Arc::new(FakeDownloader::serving(b"apk-bytes"));
        let (_dir, cache) = cache_with(&fake);

        let path = cache.path_for(URL, None);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        assert!(cache.lookup(URL, None).is_none());

        cache.fetch(URL, None).unwrap();
        assert_eq!(fake.transfers(), 1);
        assert_eq!(cache.lookup(URL, None).unwrap().size_bytes, 9);
    }

    #[test]
    fn failed_download_leaves_no_entry() {
        let fake = Arc::new(FakeDownloader::failing(404));
        let (_dir, cache) = cache_with(&fake);

        assert!(matches!(cache.fetch(URL, None), Err(DownloadError::Status(404))));
        let dir = cache.path_for(URL, None).parent().unwrap().to_path_buf();
        assert_eq!(fs::read_dir(dir).unwrap().count(), 0);
    }

    #[test]
    fn empty_body_is_an_error() {
        let fake = Arc::new(FakeDownloader::serving(b""));
        let (_dir, cache) = cache_with(&fake);
        assert!(matches!(cache.fetch(URL, None), Err(DownloadError::Empty)));
        assert!(cache.lookup(URL, None).is_none());
    }

    fn ureq_download(stub: &HttpStub) -> Result<Vec<u8>, DownloadError> {
        let mut body = Vec::new();
        UreqDownloader::new(Duration::from_secs(5), 3)
            .download(&stub.url("/minicap.so"), &mut body)
            .map(|_| body)
    }

    #[test]
    fn ureq_streams_a_200_body() {
        let stub = HttpStub::serve(vec![http_response("200 OK", "so-bytes")]);
        assert_eq!(ureq_download(&stub).unwrap(), b"so-bytes");
        assert!(stub.requests()[0].starts_with("GET /minicap.so HTTP/1.1"));
    }

    #[test]
    fn ureq_rejects_other_success_codes() {
        let stub = HttpStub::serve(vec![http_response("204 No Content", "")]);
        assert!(matches!(ureq_download(&stub), Err(DownloadError::Status(204))));
    }

    #[test]
    fn ureq_client_error_is_not_retried() {
        let stub = HttpStub::serve(vec![
            http_response("404 Not Found", "missing"),
            http_response("200 OK", "never served"),
        ]);
        assert!(matches!(ureq_download(&stub), Err(DownloadError::Status(404))));
        assert_eq!(stub.requests().len(), 1);
    }

    #[test]
    fn ureq_retries_rate_limit() {
        let stub = HttpStub::serve(vec![
            http_response("429 Too Many Requests", ""),
            http_response("200 OK", "after-wait"),
        ]);
        assert_eq!(ureq_download(&stub).unwrap(), b"after-wait");
        assert_eq!(stub.requests().len(), 2);
    }

    #[test]
    fn truncated_body_leaves_no_entry() {
        let stub = HttpStub::serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n0123456789".to_string(),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(
            dir.path().to_path_buf(),
            Arc::new(UreqDownloader::new(Duration::from_secs(5), 0)),
        );
        let url = stub.url("/minicap.so");

        assert!(matches!(cache.fetch(&url, None), Err(DownloadError::Io(_))));
        assert!(cache.lookup(&url, None).is_none());
        let entry_dir = cache.path_for(&url, None).parent().unwrap().to_path_buf();
        assert_eq!(fs::read_dir(entry_dir).unwrap().count(), 0);
    }
}
