use crate::client::events::UploadEvents;
use crate::client::{
    ApiClient, ClientUploadState, MAX_CONCURRENCY, ResumeStore, SubscriptionId, UploadOptions,
    UploadProgress, UploadSource, UploadState,
};
use crate::error::{Error, Result};
use crate::service::CompleteResult;
use crate::session::{self, SessionStatus, UploadInit};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Persist resume state after this many chunk completions (and always after
/// the last chunk).
const STATE_SAVE_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, Default)]
struct GateFlags {
    paused: bool,
    canceled: bool,
}

/// Manual-reset pause latch with a cancellation flag folded in. Chunk tasks
/// poll it at their checkpoints; cancel releases paused waiters so they
/// observe the flag instead of sleeping forever.
struct Gate {
    tx: watch::Sender<GateFlags>,
}

impl Gate {
    fn new() -> Self {
        Self {
            tx: watch::channel(GateFlags::default()).0,
        }
    }

    fn pause(&self) {
        self.tx.send_modify(|flags| flags.paused = true);
    }

    fn release(&self) {
        self.tx.send_modify(|flags| flags.paused = false);
    }

    fn cancel(&self) {
        self.tx.send_modify(|flags| {
            flags.canceled = true;
            flags.paused = false;
        });
    }

    fn is_canceled(&self) -> bool {
        self.tx.borrow().canceled
    }

    /// Parks while paused. Returns `false` once cancellation is observed.
    async fn checkpoint(&self) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            let flags = *rx.borrow_and_update();
            if flags.canceled {
                return false;
            }
            if !flags.paused {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Resolves once the upload is canceled.
    async fn canceled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if rx.borrow_and_update().canceled {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Inner {
    state: UploadState,
    upload_id: Option<String>,
    chunk_size: u64,
    total_chunks: u32,
    received: BTreeSet<u32>,
    bytes_uploaded: u64,
}

/// Client-side upload engine: slices a source into chunks, pumps them with
/// bounded concurrency and retry, survives interruption through a resume
/// store, and reports progress through typed event channels.
///
/// `start` drives the whole protocol; `pause`, `resume`, and `cancel` may be
/// called concurrently from other tasks.
pub struct Upload {
    api: ApiClient,
    source: UploadSource,
    options: UploadOptions,
    resume_store: Option<Arc<dyn ResumeStore>>,
    events: UploadEvents,
    gate: Gate,
    inner: Mutex<Inner>,
}

impl Upload {
    pub fn new(source: UploadSource, mut options: UploadOptions) -> Self {
        options.max_concurrency = options.max_concurrency.clamp(1, MAX_CONCURRENCY);
        Self {
            api: ApiClient::new(options.endpoint.clone()),
            source,
            options,
            resume_store: None,
            events: UploadEvents::default(),
            gate: Gate::new(),
            inner: Mutex::new(Inner {
                state: UploadState::Idle,
                upload_id: None,
                chunk_size: 0,
                total_chunks: 0,
                received: BTreeSet::new(),
                bytes_uploaded: 0,
            }),
        }
    }

    pub fn with_resume_store(mut self, store: Arc<dyn ResumeStore>) -> Self {
        self.resume_store = Some(store);
        self
    }

    pub fn state(&self) -> UploadState {
        self.inner().state
    }

    pub fn upload_id(&self) -> Option<String> {
        self.inner().upload_id.clone()
    }

    pub fn on_progress<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.events.on_progress(handler)
    }

    pub fn on_status<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadState) + Send + Sync + 'static,
    {
        self.events.on_status(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.events.on_error(handler)
    }

    pub fn off_progress(&self, id: SubscriptionId) -> bool {
        self.events.off_progress(id)
    }

    pub fn off_status(&self, id: SubscriptionId) -> bool {
        self.events.off_status(id)
    }

    pub fn off_error(&self, id: SubscriptionId) -> bool {
        self.events.off_error(id)
    }

    /// Drive the upload to completion: discover or create the session, pump
    /// every pending chunk, then finalize.
    pub async fn start(&self) -> Result<CompleteResult> {
        self.set_state(UploadState::Initializing);

        match self.run().await {
            Ok(result) => {
                self.set_state(UploadState::Completed);
                Ok(result)
            }
            Err(e) => {
                if matches!(e, Error::UploadCanceled { .. }) {
                    // No-op when cancel() already drove the transition; covers
                    // a cancel observed from the server side
                    self.set_state(UploadState::Canceled);
                } else {
                    self.events.emit_error(&e);
                    self.set_state(UploadState::Failed);
                }
                Err(e)
            }
        }
    }

    /// Block new chunk starts at the next checkpoint. Chunks already
    /// streaming finish their request first.
    pub fn pause(&self) {
        let mut inner = self.inner();
        if inner.state == UploadState::Uploading {
            inner.state = UploadState::Paused;
            drop(inner);
            self.gate.pause();
            self.events.emit_status(UploadState::Paused);
        }
    }

    pub fn resume(&self) {
        let mut inner = self.inner();
        if inner.state == UploadState::Paused {
            inner.state = UploadState::Uploading;
            drop(inner);
            self.gate.release();
            self.events.emit_status(UploadState::Uploading);
        }
    }

    /// Cancel the upload: release paused tasks so they observe the flag,
    /// delete the server session, and evict the resume record.
    pub async fn cancel(&self) {
        self.gate.cancel();

        let upload_id = self.inner().upload_id.clone();
        if let Some(upload_id) = &upload_id {
            // 404 is tolerated inside the client; anything else is logged
            if let Err(e) = self.api.abort_upload(upload_id).await {
                tracing::warn!(upload_id, error = %e, "Server-side abort failed during cancel");
            }
        }

        if let Some(store) = &self.resume_store {
            if let Some(upload_id) = &upload_id {
                if let Err(e) = store.remove_state(upload_id) {
                    tracing::warn!(upload_id, error = %e, "Failed to evict resume state");
                }
            }
            if let Some(key) = self.source.file_key() {
                if let Err(e) = store.remove_file_key(&key) {
                    tracing::warn!(file_key = key, error = %e, "Failed to evict file-key mapping");
                }
            }
        }

        self.set_state(UploadState::Canceled);
    }

    async fn run(&self) -> Result<CompleteResult> {
        let file_key = self.source.file_key();

        if !self.try_resume(file_key.as_deref()).await? {
            self.fresh_init(file_key.as_deref()).await?;
        }
        if self.gate.is_canceled() {
            return Err(self.canceled_error());
        }

        self.set_state(UploadState::Uploading);
        self.pump().await?;

        self.set_state(UploadState::Completing);
        self.persist_state();

        let upload_id = self
            .inner()
            .upload_id
            .clone()
            .ok_or_else(|| Error::Internal {
                msg: "upload id missing after pump".to_string(),
            })?;
        let result = self.api.complete_upload(&upload_id, None).await?;

        if let Some(store) = &self.resume_store {
            if let Err(e) = store.remove_state(&upload_id) {
                tracing::warn!(upload_id, error = %e, "Failed to remove resume state");
            }
            if let Some(key) = &file_key {
                if let Err(e) = store.remove_file_key(key) {
                    tracing::warn!(file_key = key, error = %e, "Failed to remove file-key mapping");
                }
            }
        }

        Ok(result)
    }

    /// Look the file up in the resume store and adopt the server's view of
    /// the session. Returns `false` when a fresh init is needed.
    async fn try_resume(&self, file_key: Option<&str>) -> Result<bool> {
        let (Some(store), Some(key)) = (&self.resume_store, file_key) else {
            return Ok(false);
        };

        let saved_id = match store.find_by_file(key) {
            Ok(Some(saved_id)) => saved_id,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(file_key = key, error = %e, "Resume lookup failed, starting fresh");
                return Ok(false);
            }
        };

        match self.api.get_status(&saved_id).await {
            Ok(status)
                if matches!(
                    status.status,
                    SessionStatus::Completed | SessionStatus::Canceled
                ) =>
            {
                self.evict(store.as_ref(), &saved_id, key);
                Ok(false)
            }
            Ok(status) => {
                let received: BTreeSet<u32> = status.received_chunks.iter().copied().collect();
                // Reconstruct the byte count exactly; the last index carries
                // the remainder
                let bytes_uploaded = received
                    .iter()
                    .map(|&i| {
                        session::expected_chunk_size(
                            i,
                            status.total_chunks,
                            status.file_size,
                            status.chunk_size,
                        )
                    })
                    .sum();

                let mut inner = self.inner();
                inner.upload_id = Some(saved_id.clone());
                inner.chunk_size = status.chunk_size;
                inner.total_chunks = status.total_chunks;
                inner.received = received;
                inner.bytes_uploaded = bytes_uploaded;
                drop(inner);

                tracing::info!(
                    upload_id = saved_id,
                    received = status.received_chunks.len(),
                    total = status.total_chunks,
                    "Resuming upload session"
                );
                Ok(true)
            }
            Err(Error::UploadNotFound { .. }) => {
                self.evict(store.as_ref(), &saved_id, key);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn fresh_init(&self, file_key: Option<&str>) -> Result<()> {
        let init = UploadInit {
            file_name: self.source.file_name().map(str::to_string),
            file_size: self.source.size(),
            mime_type: self.options.mime_type.clone(),
            metadata: self.options.metadata.clone(),
            desired_chunk_size: self.options.chunk_size,
        };

        let session = self.api.init_upload(&init).await?;

        {
            let mut inner = self.inner();
            inner.upload_id = Some(session.upload_id.clone());
            inner.chunk_size = session.chunk_size;
            inner.total_chunks = session.total_chunks;
            inner.received.clear();
            inner.bytes_uploaded = 0;
        }

        if let Some(store) = &self.resume_store {
            self.persist_state();
            if let Some(key) = file_key {
                if let Err(e) = store.set_file_key(key, &session.upload_id) {
                    tracing::warn!(file_key = key, error = %e, "Failed to index upload by file key");
                }
            }
        }

        Ok(())
    }

    /// The chunk pump: keeps up to `max_concurrency` uploads in flight until
    /// the pending list drains. After the first failure no new chunk starts,
    /// but everything already in flight settles before the error surfaces.
    async fn pump(&self) -> Result<()> {
        let (upload_id, chunk_size, total_chunks, received) = {
            let inner = self.inner();
            let upload_id = inner.upload_id.clone().ok_or_else(|| Error::Internal {
                msg: "pump started without a session".to_string(),
            })?;
            (
                upload_id,
                inner.chunk_size,
                inner.total_chunks,
                inner.received.clone(),
            )
        };
        let file_size = self.source.size();

        let pending: Vec<u32> = (0..total_chunks).filter(|i| !received.contains(i)).collect();
        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut first_err: Option<Error> = None;
        let mut since_save = 0u32;

        loop {
            while first_err.is_none() && in_flight.len() < self.options.max_concurrency {
                match queue.next() {
                    Some(index) => in_flight.push(self.upload_one(
                        &upload_id,
                        index,
                        chunk_size,
                        total_chunks,
                        file_size,
                    )),
                    None => break,
                }
            }

            let Some(result) = in_flight.next().await else {
                break;
            };

            match result {
                Ok((index, size)) => {
                    let (progress, all_done) = {
                        let mut inner = self.inner();
                        inner.received.insert(index);
                        inner.bytes_uploaded += size;
                        let progress = UploadProgress {
                            bytes_uploaded: inner.bytes_uploaded,
                            total_bytes: file_size,
                            percentage: session::progress_percentage(
                                inner.bytes_uploaded,
                                file_size,
                            ),
                            chunk_index: index,
                            chunks_completed: inner.received.len() as u32,
                            total_chunks,
                        };
                        (progress, inner.received.len() as u32 == total_chunks)
                    };
                    self.events.emit_progress(&progress);

                    since_save += 1;
                    if since_save >= STATE_SAVE_EVERY || all_done {
                        self.persist_state();
                        since_save = 0;
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Upload one chunk with retry and exponential backoff. The retry count
    /// includes the first attempt.
    async fn upload_one(
        &self,
        upload_id: &str,
        index: u32,
        chunk_size: u64,
        total_chunks: u32,
        file_size: u64,
    ) -> Result<(u32, u64)> {
        // Checkpoint: before slicing the body
        if !self.gate.checkpoint().await {
            return Err(self.canceled_error());
        }

        let expected = session::expected_chunk_size(index, total_chunks, file_size, chunk_size);
        let offset = index as u64 * chunk_size;
        let data = self.source.read_chunk(offset, expected).await?;

        let hash = self
            .options
            .chunk_hashes
            .then(|| format!("{:x}", Sha256::digest(&data)));

        let mut attempt = 1u32;
        loop {
            if self.gate.is_canceled() {
                return Err(self.canceled_error());
            }

            match self
                .api
                .upload_chunk(upload_id, index, data.clone(), hash.as_deref())
                .await
            {
                Ok(_) => return Ok((index, expected)),
                Err(e @ Error::UploadCanceled { .. }) => return Err(e),
                Err(e) if attempt >= self.options.retry_attempts => return Err(e),
                Err(e) => {
                    let delay = self.options.retry_delay * (1u32 << (attempt - 1).min(16));
                    tracing::warn!(
                        upload_id,
                        index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chunk upload failed, retrying"
                    );

                    // Checkpoint: before the retry sleep
                    if !self.gate.checkpoint().await {
                        return Err(self.canceled_error());
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.gate.canceled() => return Err(self.canceled_error()),
                    }

                    attempt += 1;
                }
            }
        }
    }

    fn evict(&self, store: &dyn ResumeStore, upload_id: &str, file_key: &str) {
        if let Err(e) = store.remove_state(upload_id) {
            tracing::warn!(upload_id, error = %e, "Failed to evict stale resume state");
        }
        if let Err(e) = store.remove_file_key(file_key) {
            tracing::warn!(file_key, error = %e, "Failed to evict stale file-key mapping");
        }
    }

    fn persist_state(&self) {
        let Some(store) = &self.resume_store else {
            return;
        };
        let state = {
            let inner = self.inner();
            let Some(upload_id) = inner.upload_id.clone() else {
                return;
            };
            ClientUploadState {
                upload_id,
                file_name: self.source.file_name().map(str::to_string),
                file_size: self.source.size(),
                chunk_size: inner.chunk_size,
                total_chunks: inner.total_chunks,
                received_chunks: inner.received.iter().copied().collect(),
                metadata: self.options.metadata.clone(),
            }
        };
        if let Err(e) = store.save_state(&state) {
            tracing::warn!(upload_id = state.upload_id, error = %e, "Failed to persist resume state");
        }
    }

    fn canceled_error(&self) -> Error {
        Error::UploadCanceled {
            upload_id: self.inner().upload_id.clone().unwrap_or_default(),
        }
    }

    fn set_state(&self, state: UploadState) {
        {
            let mut inner = self.inner();
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        self.events.emit_status(state);
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
