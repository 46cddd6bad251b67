//! The transfer engine proper: retry/resume driver for both paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::source::{ChapterSource, OpenOutcome};
use crate::store::{ChapterStore, UploadedPart};
use crate::{backoff_delay, Error, Result, TransferConfig};
use courtside_types::ChapterRef;

/// Which of the two contract paths to use for a transfer.
#[derive(Debug, Clone)]
pub enum TransferPath {
    /// Download to scratch storage with resume, then multipart-upload the
    /// file. Preferred when the camera link is flakier than the uplink.
    DiskStaged { scratch_dir: PathBuf },
    /// Producer-consumer pipeline from camera bytes straight into multipart
    /// parts; never touches local disk.
    Streaming,
}

/// Result of one chapter transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub key: String,
    pub bytes: u64,
    /// True when the HEAD short-circuit found the object already present.
    pub skipped: bool,
}

enum Attempt {
    Done(u64),
    Retry(String),
}

pub struct TransferEngine {
    config: TransferConfig,
    store: Arc<dyn ChapterStore>,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn ChapterStore>, config: TransferConfig) -> Self {
        TransferEngine { config, store }
    }

    pub fn store(&self) -> &Arc<dyn ChapterStore> {
        &self.store
    }

    /// Transfer one chapter to `key`, honouring the idempotence
    /// short-circuit: a HEAD hit skips every camera request.
    pub async fn transfer_chapter(
        &self,
        source: &dyn ChapterSource,
        chapter: &ChapterRef,
        key: &str,
        path: &TransferPath,
    ) -> Result<TransferOutcome> {
        if self.store.exists(key).await? {
            info!("{key} already present, skipping transfer");
            return Ok(TransferOutcome {
                key: key.to_string(),
                bytes: chapter.size_bytes,
                skipped: true,
            });
        }

        let bytes = match path {
            TransferPath::DiskStaged { scratch_dir } => {
                tokio::fs::create_dir_all(scratch_dir).await?;
                let local = scratch_dir.join(&chapter.filename);
                self.download_to_file(source, chapter, &local).await?;
                let bytes = self.upload_local_file(&local, key).await?;
                // The camera copy is the backup; the scratch copy has served
                // its purpose once the upload completed.
                if let Err(err) = tokio::fs::remove_file(&local).await {
                    warn!("could not remove scratch file {}: {err}", local.display());
                }
                bytes
            }
            TransferPath::Streaming => self.stream_to_store(source, chapter, key).await?,
        };

        Ok(TransferOutcome {
            key: key.to_string(),
            bytes,
            skipped: false,
        })
    }

    /// Download half of the disk-staged path. The on-disk partial is the
    /// resume state: it is appended to across attempts and never deleted on
    /// failure.
    pub async fn download_to_file(
        &self,
        source: &dyn ChapterSource,
        chapter: &ChapterRef,
        local: &Path,
    ) -> Result<u64> {
        let expected = chapter.size_bytes;
        let mut last = String::from("no attempt made");

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let current = match tokio::fs::metadata(local).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            if expected > 0 && current >= expected {
                info!("{} already complete on disk ({current} bytes)", chapter.filename);
                return Ok(current);
            }

            match self
                .download_attempt(source, chapter, local, current, expected)
                .await
            {
                Ok(Attempt::Done(size)) => return Ok(size),
                Ok(Attempt::Retry(reason)) | Err(reason) => {
                    warn!(
                        "{}: attempt {}/{} failed: {reason}",
                        chapter.filename,
                        attempt + 1,
                        self.config.max_retries
                    );
                    last = reason;
                }
            }
        }

        Err(Error::Exhausted {
            filename: chapter.filename.clone(),
            attempts: self.config.max_retries,
            last,
        })
    }

    async fn download_attempt(
        &self,
        source: &dyn ChapterSource,
        chapter: &ChapterRef,
        local: &Path,
        offset: u64,
        expected: u64,
    ) -> std::result::Result<Attempt, String> {
        let outcome = source
            .open(chapter, offset)
            .await
            .map_err(|e| e.to_string())?;
        let mut stream = match outcome {
            OpenOutcome::AlreadyComplete => return Ok(Attempt::Done(offset)),
            OpenOutcome::Stream { stream, .. } => stream,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(local)
            .await
            .map_err(|e| e.to_string())?;

        loop {
            let chunk = tokio::time::timeout(self.config.read_timeout, stream.next()).await;
            match chunk {
                Err(_) => return Ok(Attempt::Retry(Error::ReadStall.to_string())),
                Ok(None) => break,
                Ok(Some(Err(err))) => return Ok(Attempt::Retry(err.to_string())),
                Ok(Some(Ok(bytes))) => {
                    file.write_all(&bytes).await.map_err(|e| e.to_string())?;
                }
            }
        }
        file.flush().await.map_err(|e| e.to_string())?;

        let final_size = tokio::fs::metadata(local)
            .await
            .map_err(|e| e.to_string())?
            .len();
        if expected == 0 || final_size >= expected {
            debug!("{} downloaded, {final_size} bytes", chapter.filename);
            Ok(Attempt::Done(final_size))
        } else {
            Ok(Attempt::Retry(format!(
                "incomplete: {final_size} of {expected} bytes"
            )))
        }
    }

    /// Upload half of the disk-staged path: sequential multipart from the
    /// scratch file. Aborts the multipart upload on any failure.
    pub async fn upload_local_file(&self, local: &Path, key: &str) -> Result<u64> {
        let size = tokio::fs::metadata(local).await?.len();
        let mut file = tokio::fs::File::open(local).await?;
        let upload_id = self.store.create_multipart(key).await?;

        let mut parts: Vec<UploadedPart> = Vec::new();
        let mut part_number = 1i32;
        let mut total = 0u64;

        loop {
            let body = match read_part(&mut file, self.config.part_size).await {
                Ok(body) => body,
                Err(err) => {
                    self.abort_quietly(key, &upload_id).await;
                    return Err(err.into());
                }
            };
            if body.is_empty() {
                break;
            }
            total += body.len() as u64;
            match self
                .store
                .upload_part(key, &upload_id, part_number, body)
                .await
            {
                Ok(part) => parts.push(part),
                Err(err) => {
                    self.abort_quietly(key, &upload_id).await;
                    return Err(err.into());
                }
            }
            part_number += 1;
        }

        if parts.is_empty() {
            self.abort_quietly(key, &upload_id).await;
            return Err(Error::EmptyTransfer {
                filename: local.display().to_string(),
            });
        }

        if let Err(err) = self.store.complete_multipart(key, &upload_id, parts).await {
            self.abort_quietly(key, &upload_id).await;
            return Err(err.into());
        }
        info!("uploaded {} ({total} bytes) to {key}", local.display());
        debug_assert_eq!(total, size);
        Ok(total)
    }

    /// Streaming path: camera bytes buffered into parts and dispatched to
    /// the multipart upload as each part closes. The committed byte count
    /// (bytes inside closed parts) is the resume state across attempts.
    async fn stream_to_store(
        &self,
        source: &dyn ChapterSource,
        chapter: &ChapterRef,
        key: &str,
    ) -> Result<u64> {
        let expected = chapter.size_bytes;
        let upload_id = self.store.create_multipart(key).await?;
        let mut parts: Vec<UploadedPart> = Vec::new();
        let mut committed = 0u64;
        let mut last = String::from("no attempt made");

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            match self
                .stream_attempt(source, chapter, key, &upload_id, &mut parts, &mut committed)
                .await
            {
                Ok(Attempt::Done(total)) => {
                    if parts.is_empty() {
                        self.abort_quietly(key, &upload_id).await;
                        return Err(Error::EmptyTransfer {
                            filename: chapter.filename.clone(),
                        });
                    }
                    if let Err(err) = self
                        .store
                        .complete_multipart(key, &upload_id, std::mem::take(&mut parts))
                        .await
                    {
                        self.abort_quietly(key, &upload_id).await;
                        return Err(err.into());
                    }
                    info!("streamed {} ({total} bytes) to {key}", chapter.filename);
                    return Ok(total);
                }
                Ok(Attempt::Retry(reason)) => {
                    warn!(
                        "{}: streaming attempt {}/{} failed: {reason}",
                        chapter.filename,
                        attempt + 1,
                        self.config.max_retries
                    );
                    last = reason;
                }
                Err(reason) => {
                    last = reason;
                }
            }
        }

        self.abort_quietly(key, &upload_id).await;
        Err(Error::Exhausted {
            filename: chapter.filename.clone(),
            attempts: self.config.max_retries,
            last,
        })
    }

    async fn stream_attempt(
        &self,
        source: &dyn ChapterSource,
        chapter: &ChapterRef,
        key: &str,
        upload_id: &str,
        parts: &mut Vec<UploadedPart>,
        committed: &mut u64,
    ) -> std::result::Result<Attempt, String> {
        let expected = chapter.size_bytes;
        let outcome = source
            .open(chapter, *committed)
            .await
            .map_err(|e| e.to_string())?;
        let mut stream = match outcome {
            OpenOutcome::AlreadyComplete => return Ok(Attempt::Done(*committed)),
            OpenOutcome::Stream { stream, .. } => stream,
        };

        // Bytes in this buffer are not yet committed; a failed attempt
        // discards them and resumes from the last closed part.
        let mut buffer = BytesMut::with_capacity(self.config.part_size);

        loop {
            let chunk = tokio::time::timeout(self.config.read_timeout, stream.next()).await;
            match chunk {
                Err(_) => return Ok(Attempt::Retry(Error::ReadStall.to_string())),
                Ok(Some(Err(err))) => return Ok(Attempt::Retry(err.to_string())),
                Ok(Some(Ok(bytes))) => {
                    buffer.extend_from_slice(&bytes);
                    if buffer.len() >= self.config.part_size {
                        let body = buffer.split().freeze();
                        let len = body.len() as u64;
                        let part_number = parts.len() as i32 + 1;
                        match self
                            .store
                            .upload_part(key, upload_id, part_number, body)
                            .await
                        {
                            Ok(part) => {
                                parts.push(part);
                                *committed += len;
                            }
                            Err(err) => return Ok(Attempt::Retry(err.to_string())),
                        }
                    }
                }
                Ok(None) => {
                    let pending = buffer.len() as u64;
                    if expected > 0 && *committed + pending < expected {
                        return Ok(Attempt::Retry(format!(
                            "incomplete: {} of {expected} bytes",
                            *committed + pending
                        )));
                    }
                    if !buffer.is_empty() {
                        let body = buffer.split().freeze();
                        let len = body.len() as u64;
                        let part_number = parts.len() as i32 + 1;
                        match self
                            .store
                            .upload_part(key, upload_id, part_number, body)
                            .await
                        {
                            Ok(part) => {
                                parts.push(part);
                                *committed += len;
                            }
                            Err(err) => return Ok(Attempt::Retry(err.to_string())),
                        }
                    }
                    return Ok(Attempt::Done(*committed));
                }
            }
        }
    }

    async fn abort_quietly(&self, key: &str, upload_id: &str) {
        if let Err(err) = self.store.abort_multipart(key, upload_id).await {
            warn!("failed to abort multipart upload for {key}: {err}");
        }
    }
}

/// Read up to `part_size` bytes from the file (less only at EOF).
async fn read_part(file: &mut tokio::fs::File, part_size: usize) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(part_size);
    let mut limited = file.take(part_size as u64);
    loop {
        let n = limited.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex;

    // ---------------------------
    // in-memory store

    #[derive(Default)]
    struct MemStoreInner {
        objects: HashMap<String, Vec<u8>>,
        // (key, upload_id) -> part_number -> bytes
        uploads: HashMap<(String, String), BTreeMap<i32, Vec<u8>>>,
        aborted: Vec<(String, String)>,
        part_history: Vec<usize>,
        next_upload: u32,
    }

    #[derive(Default)]
    struct MemStore {
        inner: Mutex<MemStoreInner>,
    }

    impl MemStore {
        fn object(&self, key: &str) -> Option<Vec<u8>> {
            self.inner.lock().unwrap().objects.get(key).cloned()
        }

        fn aborted_count(&self) -> usize {
            self.inner.lock().unwrap().aborted.len()
        }

        fn part_history(&self) -> Vec<usize> {
            self.inner.lock().unwrap().part_history.clone()
        }
    }

    #[async_trait::async_trait]
    impl ChapterStore for MemStore {
        async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
            Ok(self.inner.lock().unwrap().objects.contains_key(key))
        }

        async fn head_size(&self, key: &str) -> std::result::Result<Option<u64>, StoreError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .objects
                .get(key)
                .map(|o| o.len() as u64))
        }

        async fn create_multipart(&self, key: &str) -> std::result::Result<String, StoreError> {
            let mut inner = self.inner.lock().unwrap();
            inner.next_upload += 1;
            let id = format!("upload-{}", inner.next_upload);
            inner
                .uploads
                .insert((key.to_string(), id.clone()), BTreeMap::new());
            Ok(id)
        }

        async fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> std::result::Result<UploadedPart, StoreError> {
            let mut inner = self.inner.lock().unwrap();
            inner.part_history.push(body.len());
            let parts = inner
                .uploads
                .get_mut(&(key.to_string(), upload_id.to_string()))
                .ok_or_else(|| StoreError::Sdk("no such upload".into()))?;
            parts.insert(part_number, body.to_vec());
            Ok(UploadedPart {
                part_number,
                etag: format!("etag-{part_number}"),
            })
        }

        async fn complete_multipart(
            &self,
            key: &str,
            upload_id: &str,
            parts: Vec<UploadedPart>,
        ) -> std::result::Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            let stored = inner
                .uploads
                .remove(&(key.to_string(), upload_id.to_string()))
                .ok_or_else(|| StoreError::Sdk("no such upload".into()))?;
            let mut assembled = Vec::new();
            for part in parts {
                assembled.extend_from_slice(&stored[&part.part_number]);
            }
            inner.objects.insert(key.to_string(), assembled);
            Ok(())
        }

        async fn abort_multipart(&self, key: &str, upload_id: &str) -> std::result::Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            inner
                .uploads
                .remove(&(key.to_string(), upload_id.to_string()));
            inner
                .aborted
                .push((key.to_string(), upload_id.to_string()));
            Ok(())
        }

        async fn put_file(&self, path: &Path, key: &str) -> std::result::Result<u64, StoreError> {
            let data = std::fs::read(path)?;
            let len = data.len() as u64;
            self.inner
                .lock()
                .unwrap()
                .objects
                .insert(key.to_string(), data);
            Ok(len)
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.lock().unwrap().objects.remove(key);
            Ok(())
        }

        async fn list_prefix(&self, prefix: &str) -> std::result::Result<Vec<(String, u64)>, StoreError> {
            let inner = self.inner.lock().unwrap();
            let mut out: Vec<(String, u64)> = inner
                .objects
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.len() as u64))
                .collect();
            out.sort();
            Ok(out)
        }

        async fn presign_get(
            &self,
            key: &str,
            _expires_in: std::time::Duration,
        ) -> std::result::Result<String, StoreError> {
            Ok(format!("mem://{key}"))
        }
    }

    // ---------------------------
    // scripted source

    /// Per-attempt plan: serve this many bytes from the requested offset and
    /// then fail, or serve to the end (None).
    struct ScriptedSource {
        data: Vec<u8>,
        plan: Mutex<VecDeque<Option<usize>>>,
        opens: Mutex<Vec<u64>>,
    }

    impl ScriptedSource {
        fn new(data: Vec<u8>, plan: Vec<Option<usize>>) -> Self {
            ScriptedSource {
                data,
                plan: Mutex::new(plan.into()),
                opens: Mutex::new(Vec::new()),
            }
        }

        fn open_offsets(&self) -> Vec<u64> {
            self.opens.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChapterSource for ScriptedSource {
        async fn open(&self, _chapter: &ChapterRef, offset: u64) -> crate::Result<OpenOutcome> {
            self.opens.lock().unwrap().push(offset);
            if offset as usize >= self.data.len() && offset > 0 {
                return Ok(OpenOutcome::AlreadyComplete);
            }
            let step = self.plan.lock().unwrap().pop_front().unwrap_or(None);
            let tail = self.data[offset as usize..].to_vec();
            let (serve, then_fail) = match step {
                Some(n) => (tail[..n.min(tail.len())].to_vec(), true),
                None => (tail, false),
            };
            let mut items: Vec<crate::Result<Bytes>> = serve
                .chunks(8 * 1024)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            if then_fail {
                items.push(Err(Error::ReadStall));
            }
            Ok(OpenOutcome::Stream {
                resumed: offset > 0,
                content_length: Some((self.data.len() - offset as usize) as u64),
                stream: futures::stream::iter(items).boxed(),
            })
        }
    }

    fn test_chapter(size: u64) -> ChapterRef {
        ChapterRef {
            directory: "100GOPRO".to_string(),
            filename: "GX010041.MP4".to_string(),
            size_bytes: size,
        }
    }

    fn engine_with(store: Arc<MemStore>, part_size: usize, retries: u32) -> TransferEngine {
        TransferEngine::new(
            store,
            TransferConfig {
                chunk_size: 8 * 1024,
                part_size,
                connect_timeout: std::time::Duration::from_secs(1),
                read_timeout: std::time::Duration::from_secs(5),
                max_retries: retries,
            },
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn disk_staged_path_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 3);
        let data = payload(40 * 1024);
        let source = ScriptedSource::new(data.clone(), vec![None]);
        let chapter = test_chapter(data.len() as u64);

        let outcome = engine
            .transfer_chapter(
                &source,
                &chapter,
                "raw-chapters/s/chapter_001_GX010041.MP4",
                &TransferPath::DiskStaged {
                    scratch_dir: dir.path().to_path_buf(),
                },
            )
            .await
            .unwrap();

        assert!(!outcome.skipped);
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(
            store.object("raw-chapters/s/chapter_001_GX010041.MP4"),
            Some(data)
        );
        // scratch file is gone after a successful upload
        assert!(!dir.path().join("GX010041.MP4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn disk_staged_resume_appends_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 64 * 1024, 5);
        let data = payload(50 * 1024);
        // first attempt dies after 20 KiB, second serves the rest
        let source = ScriptedSource::new(data.clone(), vec![Some(20 * 1024), None]);
        let chapter = test_chapter(data.len() as u64);
        let local = dir.path().join("GX010041.MP4");

        let size = engine
            .download_to_file(&source, &chapter, &local)
            .await
            .unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(std::fs::read(&local).unwrap(), data);
        // the second open carried the resume offset
        assert_eq!(source.open_offsets(), vec![0, 20 * 1024]);
    }

    #[tokio::test(start_paused = true)]
    async fn head_hit_short_circuits() {
        let store = Arc::new(MemStore::default());
        store
            .inner
            .lock()
            .unwrap()
            .objects
            .insert("k".to_string(), vec![1, 2, 3]);
        let engine = engine_with(store.clone(), 16 * 1024, 3);
        let data = payload(1024);
        let source = ScriptedSource::new(data, vec![None]);
        let chapter = test_chapter(1024);

        let outcome = engine
            .transfer_chapter(&source, &chapter, "k", &TransferPath::Streaming)
            .await
            .unwrap();
        assert!(outcome.skipped);
        // no camera request was made
        assert!(source.open_offsets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_path_parts_meet_threshold() {
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 3);
        let data = payload(40 * 1024);
        let source = ScriptedSource::new(data.clone(), vec![None]);
        let chapter = test_chapter(data.len() as u64);

        let outcome = engine
            .transfer_chapter(&source, &chapter, "k", &TransferPath::Streaming)
            .await
            .unwrap();
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(store.object("k"), Some(data));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_resume_restarts_at_committed_bytes() {
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 5);
        let data = payload(50 * 1024);
        // dies after 20 KiB: one 16 KiB part committed, 4 KiB discarded
        let source = ScriptedSource::new(data.clone(), vec![Some(20 * 1024), None]);
        let chapter = test_chapter(data.len() as u64);

        let outcome = engine
            .transfer_chapter(&source, &chapter, "k", &TransferPath::Streaming)
            .await
            .unwrap();
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(store.object("k"), Some(data));
        assert_eq!(source.open_offsets(), vec![0, 16 * 1024]);
    }

    #[tokio::test(start_paused = true)]
    async fn already_complete_resume_finishes_upload() {
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 5);
        let data = payload(32 * 1024);
        // first attempt serves everything but dies before EOF is seen; the
        // retry's range request is then unsatisfiable
        let source = ScriptedSource::new(data.clone(), vec![Some(32 * 1024)]);
        let chapter = test_chapter(data.len() as u64);

        let outcome = engine
            .transfer_chapter(&source, &chapter, "k", &TransferPath::Streaming)
            .await
            .unwrap();
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(store.object("k"), Some(data));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transfer_aborts_multipart_and_keeps_partial() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 2);
        let data = payload(50 * 1024);
        let source = ScriptedSource::new(data, vec![Some(1024), Some(1024), Some(1024)]);
        let chapter = test_chapter(50 * 1024);

        // streaming: multipart must be aborted
        let err = engine
            .transfer_chapter(&source, &chapter, "k", &TransferPath::Streaming)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exhausted { attempts: 2, .. }));
        assert!(store.object("k").is_none());
        assert_eq!(store.aborted_count(), 1);

        // disk-staged: the partial survives for the next run
        let source2 = ScriptedSource::new(payload(50 * 1024), vec![Some(1024), Some(1024)]);
        let local = dir.path().join("GX010041.MP4");
        let err = engine
            .download_to_file(&source2, &chapter, &local)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert!(local.exists());
        assert!(std::fs::metadata(&local).unwrap().len() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_is_an_error() {
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 1);
        let source = ScriptedSource::new(Vec::new(), vec![None]);
        // unknown size: clean EOF with zero bytes
        let chapter = test_chapter(0);
        let err = engine
            .transfer_chapter(&source, &chapter, "k", &TransferPath::Streaming)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyTransfer { .. }));
        assert_eq!(store.aborted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_part_sizes_respect_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::default());
        let engine = engine_with(store.clone(), 16 * 1024, 1);
        let data = payload(40 * 1024);
        let local = dir.path().join("chapter.bin");
        std::fs::write(&local, &data).unwrap();

        engine.upload_local_file(&local, "k").await.unwrap();
        assert_eq!(store.object("k"), Some(data));
        // every part except the last is exactly at the threshold
        assert_eq!(store.part_history(), vec![16 * 1024, 16 * 1024, 8 * 1024]);
    }
}
