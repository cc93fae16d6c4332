use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::dav;
use crate::error::SyncError;

const LOCK_VALIDITY: Duration = Duration::from_millis(20_000);
const RENEWAL_INTERVAL: Duration = Duration::from_millis(15_000);

/// Lease window and renewal cadence. The defaults are wire contract with
/// deployed servers; only tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct LeaseTimings {
    pub validity: Duration,
    pub renewal_interval: Duration,
}

impl Default for LeaseTimings {
    fn default() -> Self {
        Self {
            validity: LOCK_VALIDITY,
            renewal_interval: RENEWAL_INTERVAL,
        }
    }
}

/// Exclusive leased write handle for the bookmarks directory.
///
/// A background task re-touches the lock resource on every renewal tick, so
/// the lease outlives a long upload. Call [`EditSession::close`] on every
/// exit path; a session dropped without closing aborts the renewal task and
/// leaves the lock to expire on its own.
#[derive(Debug)]
pub struct EditSession {
    http: Client,
    auth_header: String,
    lock_url: Url,
    bookmarks_url: Url,
    upload_mime: String,
    stopped: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    renewal: Option<JoinHandle<()>>,
}

impl EditSession {
    /// Claims the lock resource and starts the renewal loop. Construction
    /// either yields a live session or an error; no half-acquired session
    /// escapes.
    pub(crate) async fn acquire(
        http: Client,
        auth_header: String,
        lock_url: Url,
        bookmarks_url: Url,
        upload_mime: String,
        timings: LeaseTimings,
    ) -> Result<Self, SyncError> {
        touch_lock(&http, &auth_header, &lock_url).await?;

        let stopped = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let renewal = {
            let http = http.clone();
            let auth_header = auth_header.clone();
            let lock_url = lock_url.clone();
            let stopped = Arc::clone(&stopped);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(timings.renewal_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if stopped.load(Ordering::SeqCst) {
                                break;
                            }
                            // Transient renewal failures only shorten the
                            // lease; the next put/delete is the
                            // authoritative failure signal.
                            if let Err(err) = touch_lock(&http, &auth_header, &lock_url).await {
                                eprintln!("[bookdav] lock renewal failed: {err}");
                            }
                        }
                        _ = &mut shutdown_rx => break,
                    }
                }
            })
        };

        Ok(Self {
            http,
            auth_header,
            lock_url,
            bookmarks_url,
            upload_mime,
            stopped,
            shutdown: Some(shutdown_tx),
            renewal: Some(renewal),
        })
    }

    /// Uploads a bookmark file under the lease. The checksum rides along in
    /// `OC-Checksum` so the backend can verify the payload itself.
    pub async fn put_bookmark_file(
        &self,
        name: &str,
        bytes: Vec<u8>,
        checksum: &str,
    ) -> Result<(), SyncError> {
        let url = dav::resource_url(&self.bookmarks_url, name, false)?;
        let response = self
            .http
            .put(url)
            .header("Authorization", &self.auth_header)
            .header("Content-Type", &self.upload_mime)
            .header("OC-Checksum", format!("SHA1:{checksum}"))
            .body(bytes)
            .send()
            .await?;
        check_write_status(response).await
    }

    /// Deletes a bookmark file. Already absent counts as success.
    pub async fn delete_bookmarks_file(&self, name: &str) -> Result<(), SyncError> {
        let url = dav::resource_url(&self.bookmarks_url, name, false)?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_write_status(response).await
    }

    /// Stops renewal, waits for the loop to finish, then releases the lock.
    ///
    /// The join comes first so no renewal write can race the delete and
    /// re-create the lock. The delete itself is best-effort: if it fails,
    /// the lease simply expires after its validity window.
    pub async fn close(mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.await;
        }

        let released = self
            .http
            .delete(self.lock_url.clone())
            .header("Authorization", &self.auth_header)
            .send()
            .await;
        match released {
            Ok(response)
                if response.status().is_success()
                    || response.status() == StatusCode::NOT_FOUND => {}
            Ok(response) => {
                eprintln!("[bookdav] lock release returned {}", response.status());
            }
            Err(err) => {
                eprintln!("[bookdav] lock release failed: {err}");
            }
        }
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

async fn touch_lock(http: &Client, auth_header: &str, lock_url: &Url) -> Result<(), SyncError> {
    let response = http
        .put(lock_url.clone())
        .header("Authorization", auth_header)
        .body(Vec::new())
        .send()
        .await?;
    check_write_status(response).await
}

async fn check_write_status(response: reqwest::Response) -> Result<(), SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(SyncError::from_status(
        status,
        response.text().await.unwrap_or_default(),
    ))
}
