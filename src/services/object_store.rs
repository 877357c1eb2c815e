//! src/services/object_store.rs
//!
//! ObjectStore — durable file payloads on local disk plus time-limited
//! signed download URLs. Metadata lives in the schedule store; this service
//! only ever sees opaque locators. Payloads are sharded beneath
//! `base_path/{shard}/{shard}/{locator}` to keep per-directory file counts
//! bounded.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use md5::Context;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_LOCATOR_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object locator")]
    InvalidLocator,
    #[error("download link is invalid or has expired")]
    BadSignature,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectResult<T> = Result<T, ObjectError>;

/// Metadata produced by a completed upload.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub locator: String,
    pub size_bytes: i64,
    pub etag: String,
}

/// Disk-backed object store with HMAC-signed, expiring download URLs.
///
/// Signed URLs are short-lived credentials: they are minted fresh on every
/// resolution call and never persisted at rest.
#[derive(Clone)]
pub struct ObjectStore {
    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    /// Public base URL the signed download links are composed against.
    base_url: String,

    /// Secret key for the URL MAC.
    signing_key: Vec<u8>,
}

impl ObjectStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        base_url: impl Into<String>,
        signing_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            base_url: base_url.into(),
            signing_key: signing_key.into(),
        }
    }

    /// Basic locator validation to avoid trivial path traversal vectors.
    ///
    /// Rejects locators that begin with `/` or contain `..`.
    fn ensure_locator_safe(&self, locator: &str) -> ObjectResult<()> {
        if locator.is_empty() || locator.len() > MAX_LOCATOR_LEN {
            return Err(ObjectError::InvalidLocator);
        }
        if locator.starts_with('/') || locator.contains("..") {
            return Err(ObjectError::InvalidLocator);
        }
        if locator
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ObjectError::InvalidLocator);
        }
        Ok(())
    }

    /// Generate two-level shard identifiers for a locator.
    ///
    /// Uses MD5(locator) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn shards(locator: &str) -> (String, String) {
        let digest = md5::compute(locator);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified payload path.
    ///
    /// Combines base_path/{shard}/{shard}/{locator}. Parent directories may
    /// not exist yet.
    fn payload_path(&self, locator: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(locator);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(locator);
        path
    }

    /// Mint a fresh locator for a new upload: a UUID prefix plus the
    /// sanitized original filename, so locators never collide and stay
    /// readable on disk.
    pub fn new_locator(file_name: &str) -> String {
        let safe: String = file_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}/{}", Uuid::new_v4(), safe)
    }

    /// Stream-upload a payload to disk.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Atomically renames into final location.
    ///
    /// Ensures durable writes (fsync) and cleans up temp files on errors.
    pub async fn put<S>(&self, locator: &str, stream: S) -> ObjectResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_locator_safe(locator)?;

        let file_path = self.payload_path(locator);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectError::Io(io::Error::new(
                ErrorKind::Other,
                "payload path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ObjectError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectError::Io(err));
        }

        Ok(StoredObject {
            locator: locator.to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Open a payload for reading.
    ///
    /// Returns an opened File handle ready for streaming out.
    pub async fn open(&self, locator: &str) -> ObjectResult<File> {
        self.ensure_locator_safe(locator)?;
        let file_path = self.payload_path(locator);
        File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectError::NotFound(locator.to_string())
            } else {
                ObjectError::Io(err)
            }
        })
    }

    /// Best-effort payload removal.
    ///
    /// A missing file is treated as success; empty shard directories are
    /// pruned afterwards. Callers that delete a delivery record report a
    /// failure here as degraded state, not as an error.
    pub async fn remove(&self, locator: &str) -> ObjectResult<()> {
        self.ensure_locator_safe(locator)?;
        let file_path = self.payload_path(locator);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(ObjectError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    /// Compose a signed, time-limited download URL for a payload.
    ///
    /// The signature covers `locator|expires` with HMAC-SHA256; the expiry
    /// is unix seconds. A fresh URL is generated on every call.
    pub fn signed_url(&self, locator: &str, ttl_secs: u64, now: DateTime<Utc>) -> String {
        let expires = now.timestamp() + ttl_secs as i64;
        let sig = self.sign(locator, expires);
        format!(
            "{}/download/{}?expires={}&sig={}",
            self.base_url, locator, expires, sig
        )
    }

    /// Check a presented signature and expiry for a locator.
    pub fn verify(
        &self,
        locator: &str,
        expires: i64,
        sig: &str,
        now: DateTime<Utc>,
    ) -> ObjectResult<()> {
        if now.timestamp() > expires {
            return Err(ObjectError::BadSignature);
        }
        let presented = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| ObjectError::BadSignature)?;
        let mut mac = self.mac();
        mac.update(format!("{}|{}", locator, expires).as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| ObjectError::BadSignature)
    }

    fn sign(&self, locator: &str, expires: i64) -> String {
        let mut mac = self.mac();
        mac.update(format!("{}|{}", locator, expires).as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.signing_key).expect("HMAC key of any size")
    }

    /// Recursively remove empty directories up to the store root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures::stream;

    fn store(dir: &tempfile::TempDir) -> ObjectStore {
        ObjectStore::new(dir.path(), "http://localhost:3000", "test-signing-key")
    }

    fn byte_stream(chunks: Vec<&'static [u8]>) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn put_then_open_round_trips_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let locator = ObjectStore::new_locator("report.pdf");

        let stored = store
            .put(
                &locator,
                byte_stream(vec![b"hello ".as_slice(), b"world".as_slice()]),
            )
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 11);

        let mut file = store.open(&locator).await.unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let locator = ObjectStore::new_locator("notes.txt");

        store
            .put(&locator, byte_stream(vec![b"data".as_slice()]))
            .await
            .unwrap();
        store.remove(&locator).await.unwrap();
        // A second removal of a missing payload is still ok.
        store.remove(&locator).await.unwrap();
        assert!(matches!(
            store.open(&locator).await.unwrap_err(),
            ObjectError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn rejects_traversal_locators() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for bad in ["/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                store.open(bad).await.unwrap_err(),
                ObjectError::InvalidLocator
            ));
        }
    }

    #[tokio::test]
    async fn signed_url_verifies_and_rejects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let now = Utc::now();
        let url = store.signed_url("abc/report.pdf", 3600, now);

        let query = url.split_once('?').unwrap().1;
        let mut expires = 0i64;
        let mut sig = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("sig", v) => sig = v.to_string(),
                _ => {}
            }
        }

        assert!(store.verify("abc/report.pdf", expires, &sig, now).is_ok());
        // Different locator, tampered signature, or stale expiry all fail.
        assert!(store.verify("abc/other.pdf", expires, &sig, now).is_err());
        assert!(store.verify("abc/report.pdf", expires + 1, &sig, now).is_err());
        assert!(
            store
                .verify(
                    "abc/report.pdf",
                    expires,
                    &sig,
                    now + Duration::seconds(3601)
                )
                .is_err()
        );
    }
}
