//! Single-file upload worker.

use crate::error::TransferError;
use crate::logger::Logger;
use crate::orchestrator::TransferWorker;
use crate::progress::{Publisher, Ticker};
use crate::transport::{Transport, UploadBody};
use crate::types::{Metadata, UploadDescriptor};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::Arc;

/// Header carrying the object metadata as `k=v&k=v`, both sides percent-encoded.
pub const METADATA_HEADER: &str = "X-Object-Metadata";

/// Everything but unreserved characters gets escaped in header values.
const HEADER_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Path segments keep the same unreserved set.
const PATH_SEGMENT: &AsciiSet = HEADER_VALUE;

/// Per-file metadata, then `filename`, then job metadata. Later entries win.
pub fn merge_metadata(per_file: Option<&Metadata>, logical_name: &str, job: &Metadata) -> Metadata {
    let mut merged = per_file.cloned().unwrap_or_default();
    merged.insert("filename".to_string(), logical_name.to_string());
    for (key, value) in job {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

pub fn encode_metadata_header(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, HEADER_VALUE),
                utf8_percent_encode(v, HEADER_VALUE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Inverse of [`encode_metadata_header`]. Pairs that do not decode to UTF-8
/// are dropped.
pub fn decode_metadata_header(header: &str) -> Metadata {
    header
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = percent_decode_str(k).decode_utf8().ok()?;
            let v = percent_decode_str(v).decode_utf8().ok()?;
            Some((k.into_owned(), v.into_owned()))
        })
        .collect()
}

/// Best-effort MIME type from the key's extension.
pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Reader that reports every chunk handed to the transport.
struct ProgressReader<R> {
    inner: R,
    ticker: Ticker,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.ticker.progress(n as u64);
        Ok(n)
    }
}

/// What the remote side answers on a successful upload.
#[derive(Debug, Default, Deserialize)]
struct UploadReceipt {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

pub struct UploadWorker {
    transport: Arc<dyn Transport>,
    endpoint: String,
    job_metadata: Metadata,
    skip_duplicates: bool,
    chunk_size: usize,
    logger: Arc<dyn Logger>,
}

impl UploadWorker {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>, logger: Arc<dyn Logger>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            job_metadata: Metadata::new(),
            skip_duplicates: false,
            chunk_size: 64 * 1024,
            logger,
        }
    }

    /// Metadata applied to every file; wins over per-file entries.
    pub fn job_metadata(mut self, metadata: Metadata) -> Self {
        self.job_metadata = metadata;
        self
    }

    /// Treat HTTP 409 as "already there" instead of a failure.
    pub fn skip_duplicates(mut self, skip: bool) -> Self {
        self.skip_duplicates = skip;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    fn object_url(&self, key: &str) -> String {
        let path = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| utf8_percent_encode(s, PATH_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }

    pub fn upload(&self, descriptor: UploadDescriptor, mut publisher: Publisher) {
        let source = descriptor.source_path.display().to_string();
        let key = descriptor.destination_key.clone();
        self.logger.start(&source, &key);

        let metadata = merge_metadata(
            descriptor.metadata.as_ref(),
            descriptor.logical_name(),
            &self.job_metadata,
        );

        let (file, size) = match open_source(&descriptor) {
            Ok(opened) => opened,
            Err(e) => return self.fail(publisher, &source, &key, &e),
        };

        publisher.initialize(size, descriptor.logical_name());
        let body = UploadBody {
            reader: Box::new(ProgressReader {
                inner: BufReader::with_capacity(self.chunk_size, file),
                ticker: publisher.ticker(),
            }),
            len: size,
            content_type: content_type_for(&key),
        };
        let headers = vec![(METADATA_HEADER.to_string(), encode_metadata_header(&metadata))];

        let response = match self.transport.post(&self.object_url(&key), &headers, body) {
            Ok(r) => r,
            Err(e) => return self.fail(publisher, &source, &key, &TransferError::from(e)),
        };

        if response.is_success() {
            let receipt = read_receipt(response.into_reader());
            let destination = receipt.id.unwrap_or_else(|| key.clone());
            self.logger.finished(&source, &destination, size);
            publisher.finish(destination, receipt.metadata.unwrap_or(metadata));
            return;
        }

        let status = response.status;
        let err = TransferError::from_status(status, response.text());
        if self.skip_duplicates && matches!(err, TransferError::RemoteConflict) {
            self.logger.skipped(&source, &key, "already exists remotely");
            publisher.skip(key, "already exists remotely");
        } else {
            self.fail(publisher, &source, &key, &err);
        }
    }

    fn fail(&self, publisher: Publisher, source: &str, key: &str, err: &TransferError) {
        publisher.error(format!("failed to upload {source} to {key}: {err}"));
    }
}

fn open_source(descriptor: &UploadDescriptor) -> Result<(File, u64), TransferError> {
    let path = &descriptor.source_path;
    let file = File::open(path).map_err(|e| TransferError::local_io("open", path, e))?;
    let size = file
        .metadata()
        .map_err(|e| TransferError::local_io("stat", path, e))?
        .len();
    Ok((file, size))
}

/// A body that is not a JSON receipt is fine; the upload still succeeded.
fn read_receipt(mut body: Box<dyn Read + Send>) -> UploadReceipt {
    let mut buf = Vec::new();
    if body.read_to_end(&mut buf).is_err() || buf.is_empty() {
        return UploadReceipt::default();
    }
    serde_json::from_slice(&buf).unwrap_or_default()
}

impl TransferWorker for UploadWorker {
    type Descriptor = UploadDescriptor;

    fn source_of(&self, descriptor: &UploadDescriptor) -> String {
        descriptor.source_path.display().to_string()
    }

    fn transfer(&self, descriptor: UploadDescriptor, publisher: Publisher) {
        self.upload(descriptor, publisher)
    }
}
