use anyhow::Result;
use ferry::display::NoopView;
use ferry::download::DownloadWorker;
use ferry::logger::NoopLogger;
use ferry::progress::{ProgressEvent, PublisherId};
use ferry::retry::RetryPolicy;
use ferry::transport::{Response, Transport, UploadBody};
use ferry::upload::{decode_metadata_header, UploadWorker, METADATA_HEADER};
use ferry::{
    AggregationMode, Dispatcher, DownloadDescriptor, DuplicatePolicy, Metadata, Orchestrator,
    TransferError, TransferResult, TransportError, UploadDescriptor,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// In-memory object store. GETs are scripted per URL (falling back to 404),
/// POSTs read the whole body and answer 201 unless a key is scripted.
#[derive(Default)]
struct MockStore {
    gets: Mutex<HashMap<String, VecDeque<(u16, Vec<u8>)>>>,
    post_status: Mutex<HashMap<String, u16>>,
    uploads: Mutex<Vec<(String, Vec<(String, String)>, Vec<u8>)>>,
    get_count: Mutex<HashMap<String, usize>>,
}

impl MockStore {
    fn script_get(&self, url: &str, responses: Vec<(u16, &str)>) {
        self.gets.lock().insert(
            url.to_string(),
            responses
                .into_iter()
                .map(|(s, b)| (s, b.as_bytes().to_vec()))
                .collect(),
        );
    }

    fn script_post(&self, url: &str, status: u16) {
        self.post_status.lock().insert(url.to_string(), status);
    }

    fn gets_for(&self, url: &str) -> usize {
        self.get_count.lock().get(url).copied().unwrap_or(0)
    }
}

impl Transport for MockStore {
    fn get(&self, url: &str) -> Result<Response, TransportError> {
        *self.get_count.lock().entry(url.to_string()).or_default() += 1;
        let mut gets = self.gets.lock();
        let queue = gets.entry(url.to_string()).or_default();
        // The last scripted response repeats.
        let (status, body) = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
        .unwrap_or((404, b"not found".to_vec()));
        Ok(Response::from_bytes(status, body))
    }

    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        mut body: UploadBody,
    ) -> Result<Response, TransportError> {
        let mut data = Vec::new();
        body.reader
            .read_to_end(&mut data)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        self.uploads
            .lock()
            .push((url.to_string(), headers.to_vec(), data));
        let status = self.post_status.lock().get(url).copied().unwrap_or(201);
        Ok(Response::from_bytes(status, Vec::new()))
    }
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, vec![7u8; size])?;
    Ok(())
}

fn orchestrator(pool: usize, mode: AggregationMode) -> Orchestrator {
    Orchestrator::new(pool, mode, Arc::new(NoopLogger)).poll_interval(Duration::from_millis(25))
}

fn download(id: &str, filename: Option<&str>, uri: &str) -> DownloadDescriptor {
    let mut remote_metadata = Metadata::new();
    if let Some(name) = filename {
        remote_metadata.insert("filename".into(), name.into());
    }
    DownloadDescriptor {
        remote_id: id.into(),
        remote_metadata,
        content_uri: uri.into(),
    }
}

#[test]
fn three_uploads_sum_their_bytes() -> Result<()> {
    let src = tempfile::tempdir()?;
    let mut items = Vec::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        let path = src.path().join(name);
        write_file(&path, 10)?;
        items.push(UploadDescriptor::new(path, format!("in/{name}")));
    }

    let store = Arc::new(MockStore::default());
    let mut job = Metadata::new();
    job.insert("batch".into(), "7".into());
    let worker = UploadWorker::new(store.clone(), "http://store/objects", Arc::new(NoopLogger))
        .job_metadata(job)
        .chunk_size(4);

    let report = orchestrator(2, AggregationMode::ByteSum).run(items, Arc::new(worker), &mut NoopView)?;

    assert_eq!(report.aggregate, 30);
    assert_eq!(report.success.len(), 3);
    assert!(report.is_clean());

    let uploads = store.uploads.lock();
    assert_eq!(uploads.len(), 3);
    for (url, headers, body) in uploads.iter() {
        assert!(url.starts_with("http://store/objects/in/"));
        assert_eq!(body.len(), 10);
        let header = headers
            .iter()
            .find(|(k, _)| k == METADATA_HEADER)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default();
        let meta = decode_metadata_header(header);
        assert_eq!(meta.get("batch").map(String::as_str), Some("7"));
        assert!(meta.get("filename").is_some());
    }
    Ok(())
}

#[test]
fn every_descriptor_ends_up_in_exactly_one_list() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(&src.path().join("ok.bin"), 5)?;
    write_file(&src.path().join("dup.bin"), 5)?;

    let store = Arc::new(MockStore::default());
    store.script_get("http://cdn/good", vec![(200, "hello")]);
    store.script_get("http://cdn/flaky", vec![(500, "oops"), (200, "fine")]);
    store.script_get("http://cdn/down", vec![(503, "down")]);
    store.script_post("http://store/o/dup.bin", 409);

    let items: Vec<ferry::TransferDescriptor> = vec![
        UploadDescriptor::new(src.path().join("ok.bin"), "ok.bin").into(),
        UploadDescriptor::new(src.path().join("dup.bin"), "dup.bin").into(),
        UploadDescriptor::new(src.path().join("missing.bin"), "missing.bin").into(),
        download("r1", Some("good.txt"), "http://cdn/good").into(),
        download("r2", Some("flaky.txt"), "http://cdn/flaky").into(),
        download("r3", Some("down.txt"), "http://cdn/down").into(),
        download("r4", None, "http://cdn/nowhere").into(),
    ];
    let resolver = |_: &str| -> Result<String, TransferError> {
        Err(TransferError::Resolve("no api".into()))
    };
    let dispatcher = Dispatcher {
        upload: Some(UploadWorker::new(store.clone(), "http://store/o", Arc::new(NoopLogger))),
        download: Some(
            DownloadWorker::new(store.clone(), Arc::new(resolver), dest.path(), Arc::new(NoopLogger))
                .retry(RetryPolicy::immediate(3)),
        ),
    };

    let report = orchestrator(3, AggregationMode::ItemCount).run(items, Arc::new(dispatcher), &mut NoopView)?;

    assert_eq!(report.len(), 7);
    let failed: HashSet<&str> = report.failure.iter().map(TransferResult::source).collect();
    assert_eq!(failed.len(), 4);
    assert!(failed.contains("r3"));
    assert!(failed.contains("r4"));
    assert!(failed.iter().any(|s| s.ends_with("dup.bin")));
    assert!(failed.iter().any(|s| s.ends_with("missing.bin")));
    assert_eq!(report.aggregate, 3);

    assert_eq!(std::fs::read(dest.path().join("good.txt"))?, b"hello");
    assert_eq!(std::fs::read(dest.path().join("flaky.txt"))?, b"fine");
    assert!(!dest.path().join("down.txt").exists());
    assert_eq!(store.gets_for("http://cdn/down"), 3);
    assert_eq!(store.gets_for("http://cdn/nowhere"), 1);
    Ok(())
}

#[test]
fn open_publishers_never_exceed_pool_size() -> Result<()> {
    let src = tempfile::tempdir()?;
    let items: Vec<UploadDescriptor> = (0..20)
        .map(|i| {
            let path = src.path().join(format!("f{i}.dat"));
            write_file(&path, 64 + i)?;
            Ok(UploadDescriptor::new(path, format!("f{i}.dat")))
        })
        .collect::<Result<_>>()?;

    let store = Arc::new(MockStore::default());
    let worker = UploadWorker::new(store, "http://store", Arc::new(NoopLogger)).chunk_size(8);

    let mut open: HashSet<PublisherId> = HashSet::new();
    let mut peak = 0;
    let mut bytes = 0u64;
    let report = orchestrator(3, AggregationMode::ByteSum).run_with_tap(
        items,
        Arc::new(worker),
        &mut NoopView,
        |event| match event {
            ProgressEvent::Initialize { publisher, .. } => {
                open.insert(*publisher);
                peak = peak.max(open.len());
            }
            ProgressEvent::Progress { delta, .. } => bytes += *delta,
            other => {
                open.remove(&other.publisher());
            }
        },
    )?;

    assert_eq!(report.success.len(), 20);
    assert!(peak <= 3, "peak {peak}");
    assert!(open.is_empty());
    assert_eq!(report.aggregate, bytes);
    assert_eq!(bytes, (0..20).map(|i| 64 + i as u64).sum::<u64>());
    Ok(())
}

#[test]
fn expired_link_is_refreshed_once_and_succeeds() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let store = Arc::new(MockStore::default());
    store.script_get("http://cdn/old", vec![(403, "expired")]);
    store.script_get("http://cdn/new", vec![(200, "payload")]);

    let resolver = |id: &str| -> Result<String, TransferError> {
        assert_eq!(id, "r9");
        Ok("http://cdn/new".to_string())
    };
    let worker = DownloadWorker::new(store.clone(), Arc::new(resolver), dest.path(), Arc::new(NoopLogger))
        .retry(RetryPolicy::immediate(3));

    let report = orchestrator(1, AggregationMode::ByteSum).run(
        vec![download("r9", Some("doc.pdf"), "http://cdn/old")],
        Arc::new(worker),
        &mut NoopView,
    )?;

    assert!(report.is_clean());
    assert_eq!(report.aggregate, 7);
    assert_eq!(std::fs::read(dest.path().join("doc.pdf"))?, b"payload");
    assert_eq!(store.gets_for("http://cdn/old"), 1);
    assert_eq!(store.gets_for("http://cdn/new"), 1);
    Ok(())
}

#[test]
fn duplicates_are_skipped_or_renumbered() -> Result<()> {
    let dest = tempfile::tempdir()?;
    std::fs::write(dest.path().join("report.tar.gz"), b"old")?;
    std::fs::write(dest.path().join("report.1.tar.gz"), b"old")?;

    let store = Arc::new(MockStore::default());
    store.script_get("http://cdn/x", vec![(200, "new")]);
    let resolver = |_: &str| -> Result<String, TransferError> { Err(TransferError::Resolve("none".into())) };
    let item = || download("x", Some("report.tar.gz"), "http://cdn/x");

    let skipper = DownloadWorker::new(store.clone(), Arc::new(resolver), dest.path(), Arc::new(NoopLogger));
    let report = orchestrator(2, AggregationMode::ItemCount).run(vec![item()], Arc::new(skipper), &mut NoopView)?;
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.aggregate, 1);
    assert_eq!(std::fs::read(dest.path().join("report.tar.gz"))?, b"old");
    assert_eq!(store.gets_for("http://cdn/x"), 0);

    let renumber = DownloadWorker::new(store.clone(), Arc::new(resolver), dest.path(), Arc::new(NoopLogger))
        .duplicates(DuplicatePolicy::Renumber);
    let report = orchestrator(2, AggregationMode::ItemCount).run(
        vec![item(), item(), item()],
        Arc::new(renumber),
        &mut NoopView,
    )?;
    assert!(report.is_clean());
    assert_eq!(report.skipped(), 0);
    for n in 2..=4 {
        let path = dest.path().join(format!("report.{n}.tar.gz"));
        assert_eq!(std::fs::read(&path)?, b"new", "{}", path.display());
    }
    assert!(!dest.path().join("report.5.tar.gz").exists());
    Ok(())
}

#[test]
fn cancelled_job_still_reports_every_item() -> Result<()> {
    let src = tempfile::tempdir()?;
    let items: Vec<UploadDescriptor> = (0..4)
        .map(|i| {
            let path = src.path().join(format!("c{i}"));
            write_file(&path, 1)?;
            Ok(UploadDescriptor::new(path, format!("c{i}")))
        })
        .collect::<Result<_>>()?;

    let store = Arc::new(MockStore::default());
    let orch = orchestrator(2, AggregationMode::ByteSum);
    orch.cancel_handle().cancel();
    let worker = UploadWorker::new(store.clone(), "http://store", Arc::new(NoopLogger));
    let report = orch.run(items, Arc::new(worker), &mut NoopView)?;

    assert_eq!(report.failure.len(), 4);
    assert_eq!(report.aggregate, 0);
    assert!(store.uploads.lock().is_empty());
    Ok(())
}
