mod auth;
mod checksum;
mod client;
mod dav;
mod error;
mod session;

pub use auth::{AuthState, NextcloudAuth};
pub use checksum::{sha1_hex, sha1_of_file};
pub use client::{BookmarksDirState, CloudFilesState, SyncClient, SyncConfig};
pub use error::SyncError;
pub use session::{EditSession, LeaseTimings};
