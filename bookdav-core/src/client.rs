use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::auth::AuthState;
use crate::dav::{self, DavEntry};
use crate::error::SyncError;
use crate::session::{EditSession, LeaseTimings};

const DEFAULT_ROOT_DIR: &str = "bookdav";
const BOOKMARKS_DIR: &str = "bookmarks";
const LOCK_FILE: &str = ".lock";
const DEFAULT_MANAGED_NAME_RULE: &str = r"(?i)^.+\.kml$";
const REQUIRED_EXTENSION: &str = "kml";
const DEFAULT_UPLOAD_MIME: &str = "application/vnd.google-earth.kml+xml";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Version of the remote bookmarks directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarksDirState {
    /// The directory exists; the token changes whenever its contents do.
    Present { etag: String },
    /// The directory was missing; the root and bookmarks collections have
    /// been created and the next listing starts from empty.
    Absent,
}

/// Snapshot of the remote bookmarks directory, one level deep.
///
/// `managed_files` maps names this engine owns to their SHA-1 checksums;
/// everything else in the directory lands in `foreign_files` and is never
/// written or deleted. The two sets are disjoint.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CloudFilesState {
    pub managed_files: HashMap<String, String>,
    pub foreign_files: HashSet<String>,
}

/// Knobs the embedding application decides: where the engine's folder
/// lives, which remote names it may manage, and the upload content type.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub root_dir: String,
    pub managed_name_rule: Regex,
    pub upload_mime: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_dir: DEFAULT_ROOT_DIR.to_string(),
            managed_name_rule: Regex::new(DEFAULT_MANAGED_NAME_RULE).expect("valid default rule"),
            upload_mime: DEFAULT_UPLOAD_MIME.to_string(),
        }
    }
}

/// WebDAV client for one Nextcloud-style account, scoped to the fixed
/// resource layout `<root>/.lock` and `<root>/bookmarks/`.
#[derive(Clone)]
pub struct SyncClient {
    http: Client,
    auth_header: String,
    root_url: Url,
    bookmarks_url: Url,
    lock_url: Url,
    config: SyncConfig,
    timings: LeaseTimings,
}

impl SyncClient {
    pub fn new(auth: &AuthState) -> Result<Self, SyncError> {
        Self::with_config(auth, SyncConfig::default())
    }

    pub fn with_config(auth: &AuthState, config: SyncConfig) -> Result<Self, SyncError> {
        let http = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Self::with_http(http, auth, config)
    }

    /// Uses a caller-supplied HTTP client (pooling and timeouts included).
    pub fn with_http(http: Client, auth: &AuthState, config: SyncConfig) -> Result<Self, SyncError> {
        let root_url = dav_root(auth.server(), auth.login_name(), &config.root_dir)?;
        let bookmarks_url = dav::resource_url(&root_url, BOOKMARKS_DIR, true)?;
        let lock_url = dav::resource_url(&root_url, LOCK_FILE, false)?;
        Ok(Self {
            http,
            auth_header: auth.authorization_header(),
            root_url,
            bookmarks_url,
            lock_url,
            config,
            timings: LeaseTimings::default(),
        })
    }

    pub fn with_lease_timings(mut self, timings: LeaseTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Looks up the bookmarks directory's version token. A missing
    /// directory is created (root first, then bookmarks) and reported as
    /// [`BookmarksDirState::Absent`]; creation is idempotent and runs
    /// outside the lease.
    pub async fn fetch_bookmarks_dir_state(&self) -> Result<BookmarksDirState, SyncError> {
        let response = self
            .propfind(self.bookmarks_url.clone(), "0", dav::DIR_ETAG_PROPFIND)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                self.create_collection(self.root_url.clone()).await?;
                self.create_collection(self.bookmarks_url.clone()).await?;
                Ok(BookmarksDirState::Absent)
            }
            status if status.is_success() => {
                let body = response.text().await?;
                let entries = dav::parse_multistatus(&body)?;
                let etag = entries
                    .into_iter()
                    .find_map(|entry| entry.etag)
                    .ok_or_else(|| {
                        SyncError::Unexpected(
                            "bookmarks directory reported no etag".to_string(),
                        )
                    })?;
                Ok(BookmarksDirState::Present { etag })
            }
            status => Err(SyncError::from_status(
                status,
                response.text().await.unwrap_or_default(),
            )),
        }
    }

    /// Lists the bookmarks directory one level deep and classifies every
    /// entry as managed or foreign.
    pub async fn fetch_cloud_files_state(&self) -> Result<CloudFilesState, SyncError> {
        let response = self
            .propfind(self.bookmarks_url.clone(), "1", dav::LISTING_PROPFIND)
            .send()
            .await?;
        let response = check_status(response).await?;
        let body = response.text().await?;
        let entries = dav::parse_multistatus(&body)?;
        Ok(self.classify(entries))
    }

    /// A name is managed iff it matches the naming rule AND the server
    /// reported a SHA-1 for it. Ambiguity always resolves to foreign: a
    /// file this engine does not own must never be overwritten or deleted.
    fn classify(&self, entries: Vec<DavEntry>) -> CloudFilesState {
        let mut candidates: HashMap<String, Option<String>> = HashMap::new();
        let mut foreign: HashSet<String> = HashSet::new();

        for entry in entries {
            if entry.is_collection {
                continue;
            }
            let Some(name) = dav::file_name_from_href(&entry.href) else {
                continue;
            };
            if self.config.managed_name_rule.is_match(&name) && entry.sha1.is_some() {
                candidates.insert(name, entry.sha1);
            } else {
                foreign.insert(name);
            }
        }

        // Candidates without the required extension or without a checksum
        // are partially written or not ours; demote them.
        let mut managed = HashMap::new();
        for (name, sha1) in candidates {
            match sha1 {
                Some(sha1) if has_required_extension(&name) => {
                    managed.insert(name, sha1);
                }
                _ => {
                    foreign.insert(name);
                }
            }
        }

        // A name listed twice stays foreign.
        managed.retain(|name, _| !foreign.contains(name));

        CloudFilesState {
            managed_files: managed,
            foreign_files: foreign,
        }
    }

    /// Streams a remote bookmark file over `destination`, through a
    /// `.partial` sibling so a failed transfer never leaves a readable,
    /// seemingly complete file behind.
    pub async fn download_bookmark_file(
        &self,
        name: &str,
        destination: &Path,
    ) -> Result<(), SyncError> {
        let url = dav::resource_url(&self.bookmarks_url, name, false)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let response = check_status(response).await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(destination);
        if let Err(err) = write_stream(response, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        tokio::fs::rename(&partial, destination).await?;
        Ok(())
    }

    /// Acquires the exclusive edit lease, or reports how long the current
    /// holder's lease still has to run.
    ///
    /// The age of the lock resource is measured against the server's own
    /// `Date` header, so two devices with skewed clocks still agree. The
    /// claim itself is a blind write: two devices observing the same expiry
    /// in the same instant can both succeed. That window is inherent to the
    /// wire protocol and left as-is for compatibility.
    pub async fn get_edit_session(&self) -> Result<EditSession, SyncError> {
        let response = self
            .propfind(self.lock_url.clone(), "0", dav::LOCK_MTIME_PROPFIND)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NOT_FOUND {
            if !status.is_success() {
                return Err(SyncError::from_status(
                    status,
                    response.text().await.unwrap_or_default(),
                ));
            }
            let server_now = dav::server_now(response.headers());
            let body = response.text().await?;
            let last_modified = dav::parse_multistatus(&body)?
                .into_iter()
                .find_map(|entry| entry.last_modified)
                .ok_or_else(|| {
                    SyncError::Unexpected("lock resource reported no last-modified".to_string())
                })?;
            let last_modified = dav::parse_last_modified(&last_modified)?;
            // A lock stamped in the future reads as freshly held.
            let elapsed = server_now
                .duration_since(last_modified)
                .unwrap_or(Duration::ZERO);
            if elapsed < self.timings.validity {
                let remaining = self.timings.validity - elapsed;
                return Err(SyncError::LockAlreadyHeld {
                    retry_after_ms: remaining.as_millis() as u64,
                });
            }
        }

        EditSession::acquire(
            self.http.clone(),
            self.auth_header.clone(),
            self.lock_url.clone(),
            self.bookmarks_url.clone(),
            self.config.upload_mime.clone(),
            self.timings,
        )
        .await
    }

    fn propfind(&self, url: Url, depth: &str, body: &'static str) -> reqwest::RequestBuilder {
        self.http
            .request(dav::propfind_method(), url)
            .header("Authorization", &self.auth_header)
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(body)
    }

    async fn create_collection(&self, url: Url) -> Result<(), SyncError> {
        let response = self
            .http
            .request(dav::mkcol_method(), url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        match response.status() {
            // 405 means the collection already exists.
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(SyncError::from_status(
                status,
                response.text().await.unwrap_or_default(),
            )),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(SyncError::from_status(
        status,
        response.text().await.unwrap_or_default(),
    ))
}

async fn write_stream(response: reqwest::Response, partial: &Path) -> Result<(), SyncError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn has_required_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(REQUIRED_EXTENSION))
        .unwrap_or(false)
}

/// `<server>/remote.php/dav/files/<login>/<root>/`, every segment encoded.
fn dav_root(server: &Url, login: &str, root_dir: &str) -> Result<Url, SyncError> {
    let mut url = server.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SyncError::Unexpected("server url cannot be a base".to_string()))?;
        segments.pop_if_empty();
        segments.extend(["remote.php", "dav", "files", login, root_dir]);
        segments.push("");
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        let auth = AuthState::nextcloud(
            Url::parse("https://cloud.example.com").unwrap(),
            "alice",
            "wonder",
        );
        SyncClient::new(&auth).unwrap()
    }

    fn entry(href: &str, sha1: Option<&str>) -> DavEntry {
        DavEntry {
            href: href.to_string(),
            sha1: sha1.map(str::to_string),
            ..DavEntry::default()
        }
    }

    #[test]
    fn urls_follow_the_fixed_layout() {
        let client = client();
        assert_eq!(
            client.bookmarks_url.as_str(),
            "https://cloud.example.com/remote.php/dav/files/alice/bookdav/bookmarks/"
        );
        assert_eq!(
            client.lock_url.as_str(),
            "https://cloud.example.com/remote.php/dav/files/alice/bookdav/.lock"
        );
    }

    #[test]
    fn classification_partitions_managed_and_foreign() {
        let client = client();
        let state = client.classify(vec![
            DavEntry {
                href: "/remote.php/dav/files/alice/bookdav/bookmarks/".to_string(),
                is_collection: true,
                ..DavEntry::default()
            },
            entry("/bookmarks/My%20Places.kml", Some("abc123")),
            entry("/bookmarks/notes.txt", None),
            entry("/bookmarks/Broken.kml", None),
        ]);

        assert_eq!(
            state.managed_files.get("My Places.kml").map(String::as_str),
            Some("abc123")
        );
        assert!(state.foreign_files.contains("notes.txt"));
        assert!(state.foreign_files.contains("Broken.kml"));
        for name in state.managed_files.keys() {
            assert!(!state.foreign_files.contains(name));
        }
    }

    #[test]
    fn rule_match_without_checksum_is_foreign() {
        let client = client();
        let state = client.classify(vec![entry("/bookmarks/Trip.kml", None)]);
        assert!(state.managed_files.is_empty());
        assert!(state.foreign_files.contains("Trip.kml"));
    }

    #[test]
    fn wide_rule_still_requires_the_kml_extension() {
        let auth = AuthState::nextcloud(
            Url::parse("https://cloud.example.com").unwrap(),
            "alice",
            "wonder",
        );
        let config = SyncConfig {
            managed_name_rule: Regex::new(r".*").unwrap(),
            ..SyncConfig::default()
        };
        let client = SyncClient::with_config(&auth, config).unwrap();
        let state = client.classify(vec![
            entry("/bookmarks/notes.txt", Some("abc123")),
            entry("/bookmarks/Trip.kml", Some("deadbeef")),
        ]);

        assert!(state.foreign_files.contains("notes.txt"));
        assert_eq!(
            state.managed_files.get("Trip.kml").map(String::as_str),
            Some("deadbeef")
        );
    }

    #[test]
    fn partial_path_keeps_the_original_extension() {
        assert_eq!(
            partial_path(Path::new("/tmp/My Places.kml")),
            Path::new("/tmp/My Places.kml.partial")
        );
        assert_eq!(
            partial_path(Path::new("/tmp/noext")),
            Path::new("/tmp/noext.partial")
        );
    }
}
