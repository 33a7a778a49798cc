//! Single-file download worker.
//!
//! One call of [`DownloadWorker::download`] owns one remote file from start
//! to finish: it picks and claims the local path, runs whole-file GET
//! attempts under the [`RetryPolicy`], refreshes an expired pre-signed URL
//! once, and removes whatever it wrote if the transfer ultimately fails.

use crate::conflict::{self, HeldPath, PathClaims};
use crate::error::TransferError;
use crate::logger::Logger;
use crate::orchestrator::TransferWorker;
use crate::progress::Publisher;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::types::{DownloadDescriptor, DuplicatePolicy, NamingMode};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

/// Renumbered names that vanish between listing and creation are retried
/// this many times before giving up.
const MAX_CLAIM_ROUNDS: usize = 16;

/// Looks up the current download location of a remote file.
pub trait LocationResolver: Send + Sync {
    fn resolve(&self, remote_id: &str) -> Result<String, TransferError>;
}

impl<F> LocationResolver for F
where
    F: Fn(&str) -> Result<String, TransferError> + Send + Sync,
{
    fn resolve(&self, remote_id: &str) -> Result<String, TransferError> {
        self(remote_id)
    }
}

/// Resolver backed by `GET {api_base}/{remote_id}`, expecting a JSON body
/// with a `content_uri` (or `contentUri`) field.
pub struct ApiResolver {
    transport: Arc<dyn Transport>,
    api_base: String,
}

#[derive(Deserialize)]
struct ResolvedLocation {
    #[serde(alias = "contentUri")]
    content_uri: String,
}

impl ApiResolver {
    pub fn new(transport: Arc<dyn Transport>, api_base: impl Into<String>) -> Self {
        Self {
            transport,
            api_base: api_base.into(),
        }
    }
}

impl LocationResolver for ApiResolver {
    fn resolve(&self, remote_id: &str) -> Result<String, TransferError> {
        let url = format!("{}/{}", self.api_base.trim_end_matches('/'), remote_id);
        let response = self
            .transport
            .get(&url)
            .map_err(|e| TransferError::Resolve(e.to_string()))?;
        if !response.is_success() {
            let status = response.status;
            return Err(TransferError::Resolve(format!("HTTP {status}: {}", response.text())));
        }
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| TransferError::Resolve(e.to_string()))?;
        let location: ResolvedLocation =
            serde_json::from_slice(&body).map_err(|e| TransferError::Resolve(e.to_string()))?;
        Ok(location.content_uri)
    }
}

/// Logical name of a download under the given naming mode.
pub fn logical_name(descriptor: &DownloadDescriptor, naming: NamingMode) -> &str {
    match naming {
        NamingMode::ByRemoteId => &descriptor.remote_id,
        NamingMode::ByMetadataFilename => descriptor
            .metadata_filename()
            .unwrap_or(&descriptor.remote_id),
    }
}

/// Flatten a logical name into a single file name inside `dir`.
pub fn default_destination(dir: &Path, logical: &str) -> PathBuf {
    let flat = logical.replace(['/', '\\'], "_");
    let flat = match flat.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => flat,
    };
    dir.join(flat)
}

enum Claim {
    /// Path is ours; an empty file has been created there.
    Fresh(PathBuf),
    /// Path belongs to a file that was there before us.
    Existing(PathBuf),
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Read until `buf` is full or the stream ends.
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn remove_partial(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub struct DownloadWorker {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn LocationResolver>,
    destination_dir: PathBuf,
    naming: NamingMode,
    duplicates: DuplicatePolicy,
    retry: RetryPolicy,
    chunk_size: usize,
    claims: PathClaims,
    logger: Arc<dyn Logger>,
}

impl DownloadWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn LocationResolver>,
        destination_dir: impl Into<PathBuf>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            transport,
            resolver,
            destination_dir: destination_dir.into(),
            naming: NamingMode::default(),
            duplicates: DuplicatePolicy::default(),
            retry: RetryPolicy::default(),
            chunk_size: 64 * 1024,
            claims: PathClaims::new(),
            logger,
        }
    }

    pub fn naming(mut self, naming: NamingMode) -> Self {
        self.naming = naming;
        self
    }

    pub fn duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn download(&self, descriptor: DownloadDescriptor, mut publisher: Publisher) {
        let source = descriptor.remote_id.clone();
        let logical = logical_name(&descriptor, self.naming).to_string();
        let default = default_destination(&self.destination_dir, &logical);

        // Held until this function returns, after the terminal event.
        let (claim, _held) = self.claim(default);
        let path = match claim {
            Ok(Claim::Fresh(path)) => path,
            Ok(Claim::Existing(path)) => {
                let shown = path.display().to_string();
                self.logger.skipped(&source, &shown, "destination exists");
                publisher.skip(shown, "destination exists");
                return;
            }
            Err(e) => {
                let msg = format!(
                    "failed to download {source} into {}: {e}",
                    self.destination_dir.display()
                );
                publisher.error(msg);
                return;
            }
        };
        let shown = path.display().to_string();
        self.logger.start(&source, &shown);

        match self.fetch(&descriptor, &logical, &path, &mut publisher) {
            Ok(bytes) => {
                self.logger.finished(&source, &shown, bytes);
                publisher.finish(shown, descriptor.remote_metadata.clone());
            }
            Err(e) => {
                let mut msg = format!("failed to download {source} to {shown}: {e}");
                if let Err(cleanup) = remove_partial(&path) {
                    msg.push_str(&format!(" (partial file left behind: {cleanup})"));
                }
                publisher.error(msg);
            }
        }
    }

    /// Pick the destination and create it atomically. A fresh path stays
    /// held by this process until the returned guard drops. Under the skip
    /// policy, a path still being written by another worker is waited on
    /// rather than reported as existing.
    fn claim(&self, default: PathBuf) -> (Result<Claim, TransferError>, Option<HeldPath<'_>>) {
        let dir = &self.destination_dir;
        if let Err(e) = fs::create_dir_all(dir) {
            return (Err(TransferError::local_io("create directory", dir, e)), None);
        }

        let key = default.clone();
        let wait = self.duplicates == DuplicatePolicy::Skip;
        self.claims.claim_with(&key, wait, || {
            let claim = self.pick(default);
            let hold = match &claim {
                Ok(Claim::Fresh(path)) => Some(path.clone()),
                _ => None,
            };
            (claim, hold)
        })
    }

    fn pick(&self, default: PathBuf) -> Result<Claim, TransferError> {
        let dir = &self.destination_dir;
        match create_new(&default) {
            Ok(_) => return Ok(Claim::Fresh(default)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(TransferError::local_io("create", &default, e)),
        }
        if self.duplicates == DuplicatePolicy::Skip {
            return Ok(Claim::Existing(default));
        }

        let name = default
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for _ in 0..MAX_CLAIM_ROUNDS {
            let candidate = conflict::resolve_in_dir(dir, &name)
                .map_err(|e| TransferError::local_io("list", dir, e))?;
            match create_new(&candidate) {
                Ok(_) => return Ok(Claim::Fresh(candidate)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(TransferError::local_io("create", &candidate, e)),
            }
        }
        Err(TransferError::Unclassified(format!(
            "no free name for {} after {MAX_CLAIM_ROUNDS} tries",
            default.display()
        )))
    }

    /// Run attempts until one succeeds or the budget is spent. Returns the
    /// number of bytes in the final file.
    fn fetch(
        &self,
        descriptor: &DownloadDescriptor,
        logical: &str,
        path: &Path,
        publisher: &mut Publisher,
    ) -> Result<u64, TransferError> {
        let source = &descriptor.remote_id;
        let mut url = descriptor.content_uri.clone();
        let mut refreshed = false;
        let mut attempt = 1;

        loop {
            let err = match self.attempt(&url, logical, path, publisher) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            if matches!(err, TransferError::AuthorizationExpired) && !refreshed {
                refreshed = true;
                match self.resolver.resolve(source) {
                    Ok(fresh) => {
                        url = fresh;
                        self.logger.url_refreshed(source);
                        // The refreshed retry is extra; it does not use up an attempt.
                        match self.attempt(&url, logical, path, publisher) {
                            Ok(bytes) => return Ok(bytes),
                            Err(e) if self.retry.should_retry(attempt, &e) => {
                                self.note_retry(source, attempt, &e)
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    // Keep the old link; the budget decides from here.
                    Err(e) if self.retry.should_retry(attempt, &err) => self.note_retry(source, attempt, &e),
                    Err(e) => return Err(e),
                }
            } else if self.retry.should_retry(attempt, &err) {
                self.note_retry(source, attempt, &err);
            } else {
                return Err(err);
            }

            attempt += 1;
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    fn note_retry(&self, source: &str, failed_attempt: u32, cause: &TransferError) {
        self.logger
            .retry(source, failed_attempt + 1, &format!("{}: {cause}", cause.kind()));
    }

    /// One full GET into `path`, starting from an empty file.
    fn attempt(
        &self,
        url: &str,
        logical: &str,
        path: &Path,
        publisher: &mut Publisher,
    ) -> Result<u64, TransferError> {
        let response = self.transport.get(url)?;
        if !response.is_success() {
            let status = response.status;
            return Err(TransferError::from_status(status, response.text()));
        }
        publisher.initialize(response.content_length.unwrap_or(0), logical);

        // Truncate: nothing from an earlier attempt survives into this one.
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| TransferError::local_io("open", path, e))?;
        let mut reader = response.into_reader();
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let n = read_chunk(&mut *reader, &mut buf).map_err(TransferError::Stream)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| TransferError::local_io("write", path, e))?;
            total += n as u64;
            publisher.progress(n as u64);
        }
        file.flush()
            .map_err(|e| TransferError::local_io("flush", path, e))?;
        Ok(total)
    }
}

impl TransferWorker for DownloadWorker {
    type Descriptor = DownloadDescriptor;

    fn source_of(&self, descriptor: &DownloadDescriptor) -> String {
        descriptor.remote_id.clone()
    }

    fn transfer(&self, descriptor: DownloadDescriptor, publisher: Publisher) {
        self.download(descriptor, publisher)
    }
}
