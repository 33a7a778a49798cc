//! Descriptors, results and the small enums that steer a transfer job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// String key/value metadata attached to a remote object.
pub type Metadata = BTreeMap<String, String>;

/// One local file to push to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub source_path: PathBuf,
    /// Remote key, `/`-separated. Also the logical name of the file.
    pub destination_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl UploadDescriptor {
    pub fn new(source_path: impl Into<PathBuf>, destination_key: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            destination_key: destination_key.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn logical_name(&self) -> &str {
        &self.destination_key
    }
}

/// One remote file to pull into a local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub remote_id: String,
    #[serde(default)]
    pub remote_metadata: Metadata,
    /// Pre-signed URL; may expire before the transfer starts.
    #[serde(alias = "contentUri")]
    pub content_uri: String,
}

impl DownloadDescriptor {
    /// Name the file carried on the remote side, if any.
    pub fn metadata_filename(&self) -> Option<&str> {
        self.remote_metadata
            .get("filename")
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// Either direction; lets one job mix uploads and downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum TransferDescriptor {
    Upload(UploadDescriptor),
    Download(DownloadDescriptor),
}

impl TransferDescriptor {
    pub fn source_label(&self) -> String {
        match self {
            TransferDescriptor::Upload(d) => d.source_path.display().to_string(),
            TransferDescriptor::Download(d) => d.remote_id.clone(),
        }
    }
}

impl From<UploadDescriptor> for TransferDescriptor {
    fn from(d: UploadDescriptor) -> Self {
        TransferDescriptor::Upload(d)
    }
}

impl From<DownloadDescriptor> for TransferDescriptor {
    fn from(d: DownloadDescriptor) -> Self {
        TransferDescriptor::Download(d)
    }
}

/// Exactly one of these is produced per descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferResult {
    Success {
        source: String,
        destination: String,
        #[serde(default)]
        metadata: Metadata,
        /// The file already existed and nothing was transferred.
        #[serde(default)]
        skipped: bool,
    },
    Failure {
        source: String,
        error: String,
    },
}

impl TransferResult {
    pub fn source(&self) -> &str {
        match self {
            TransferResult::Success { source, .. } | TransferResult::Failure { source, .. } => source,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TransferResult::Success { skipped: true, .. })
    }
}

/// What the job-wide progress counter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Sum of every `Progress` delta.
    #[default]
    ByteSum,
    /// Number of finished or skipped files.
    ItemCount,
}

/// How a download picks its local file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NamingMode {
    ByRemoteId,
    #[default]
    ByMetadataFilename,
}

/// What a download does when its destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Skip,
    Renumber,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_descriptor_accepts_camel_case_uri() {
        let json = r#"{"remote_id":"f-1","remote_metadata":{"filename":"a/b.txt"},"contentUri":"https://x/y"}"#;
        let d: DownloadDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.content_uri, "https://x/y");
        assert_eq!(d.metadata_filename(), Some("a/b.txt"));
    }

    #[test]
    fn empty_filename_metadata_is_ignored() {
        let mut d = DownloadDescriptor {
            remote_id: "f-2".into(),
            remote_metadata: Metadata::new(),
            content_uri: String::new(),
        };
        d.remote_metadata.insert("filename".into(), String::new());
        assert_eq!(d.metadata_filename(), None);
    }

    #[test]
    fn results_serialize_with_status_tag() {
        let r = TransferResult::Failure {
            source: "a.txt".into(),
            error: "boom".into(),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "failure");
        assert_eq!(r.source(), "a.txt");
        assert!(!r.is_success());
    }
}
