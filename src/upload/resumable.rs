//! Chunked upload over the `mkblk`/`mkfile` protocol.
//!
//! The object is cut into fixed-size blocks. Each block is posted on its own
//! and answered with a context string; `mkfile` then stitches the contexts
//! together in block order. Acknowledged blocks are kept in an
//! `UploadSessionRecord` so a later call can skip them.
//!
//! Streams are cut as they are read. They keep no record and cannot be
//! restarted once their contexts expire.

use super::form::DEFAULT_MIME;
use super::recorder::{record_id, Block, Fingerprint, UploadSessionRecord};
use super::session::{StreamSource, UploadSession, UploadSource};
use super::UploadResponse;
use crate::error::{Result, UploadError};
use crate::etag::block_checksum;
use crate::http::{Body, RequestTemplate};
use crate::region::UpPurpose;
use crate::uplog::UpType;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Status the service answers `mkfile` with when block contexts expired
const CONTEXT_EXPIRED: u16 = 701;

/// Upload passes before giving up on blocks that expire faster than they finalize
const MAX_BLOCK_PASSES: usize = 2;

#[derive(Debug, Deserialize)]
struct BlockResponse {
    ctx: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    expired_at: Option<i64>,
}

/// Position of one block within the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlannedBlock {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
}

/// Cuts `size` bytes into blocks of `block_size`; the last one may be shorter
pub(crate) fn plan_blocks(size: u64, block_size: u64) -> Vec<PlannedBlock> {
    let block_size = block_size.max(1);
    (0..size.div_ceil(block_size))
        .map(|index| {
            let offset = index * block_size;
            PlannedBlock {
                index: index as usize,
                offset,
                size: block_size.min(size - offset),
            }
        })
        .collect()
}

pub(crate) async fn upload(session: &UploadSession<'_>) -> Result<UploadResponse> {
    let size = match (session.source, session.size) {
        (UploadSource::Stream(stream), _) => return upload_stream(session, stream).await,
        (_, Some(size)) => size,
        (_, None) => {
            return Err(UploadError::Integrity(
                "Chunked upload needs the source size".to_string(),
            ))
        }
    };
    let upload = ChunkedUpload::new(session, size)?;
    match upload.run(false).await {
        Err(e) if is_context_expired(&e) => {
            warn!(
                key = session.params.key.as_deref().unwrap_or_default(),
                "Block contexts expired, restarting chunked upload"
            );
            upload.discard_record();
            upload.run(true).await
        }
        other => other,
    }
}

fn is_context_expired(error: &UploadError) -> bool {
    matches!(error, UploadError::Http(err) if err.status_code() == Some(CONTEXT_EXPIRED))
}

/// Reads one block at a time and keeps up to the borrowed worker count in flight
async fn upload_stream(
    session: &UploadSession<'_>,
    source: &StreamSource,
) -> Result<UploadResponse> {
    let block_size = session.manager.config().chunk_size();
    let borrowed = borrow_permits(session.manager.permits(), session.max_concurrency - 1);
    let workers = 1 + borrowed.len();
    debug!(workers = workers, "Uploading stream");

    let parts = stream::try_unfold((0usize, 0u64), move |(index, offset)| async move {
        let data = source.read_block(block_size).await?;
        if data.is_empty() {
            return Ok(None);
        }
        let size = data.len() as u64;
        let part = PlannedBlock {
            index,
            offset,
            size,
        };
        Ok::<_, UploadError>(Some(((part, data), (index + 1, offset + size))))
    })
    .boxed();
    let mut uploads = std::pin::pin!(parts
        .map_ok(|(part, data)| send_block(session, part, data))
        .try_buffer_unordered(workers));

    let mut blocks = Vec::new();
    while let Some(block) = uploads.try_next().await? {
        session.progress.add(block.size);
        blocks.push(block);
    }
    drop(borrowed);

    blocks.sort_by_key(|block| block.index);
    let size = blocks.iter().map(|block| block.size).sum();
    let contexts: Vec<&str> = blocks.iter().map(|block| block.ctx.as_str()).collect();
    make_file(session, size, &contexts).await
}

/// Posts one block and checks the returned checksum when enabled
async fn send_block(
    session: &UploadSession<'_>,
    part: PlannedBlock,
    data: Bytes,
) -> Result<Block> {
    let checksum = block_checksum(&data);

    let template = RequestTemplate::post(
        format!("/mkblk/{}", part.size),
        UpPurpose::Chunked,
        UpType::Mkblk,
    )
    .header("Authorization", session.token.authorization())
    .header("Content-Type", "application/octet-stream")
    .body(Body::Bytes(data))
    .total_size(session.size.unwrap_or_default());
    let delivery = session
        .manager
        .transport()
        .send(session.regions, &template, Some(session.token))
        .await?;

    let body: BlockResponse = delivery.response.json()?;
    if session.checksum && body.checksum.as_deref() != Some(checksum.as_str()) {
        return Err(UploadError::Integrity(format!(
            "Block {} checksum mismatch: local {}, remote {}",
            part.index,
            checksum,
            body.checksum.as_deref().unwrap_or("<none>")
        )));
    }

    let expired_at = body.expired_at.unwrap_or_else(|| {
        session.manager.clock().now_secs()
            + session.manager.config().block_lifetime().as_secs() as i64
    });
    debug!(index = part.index, host = %delivery.endpoint, "Block uploaded");
    Ok(Block {
        index: part.index,
        offset: part.offset,
        size: part.size,
        checksum,
        ctx: body.ctx,
        host: body.host.unwrap_or(delivery.endpoint),
        expired_at,
    })
}

async fn make_file(
    session: &UploadSession<'_>,
    size: u64,
    contexts: &[&str],
) -> Result<UploadResponse> {
    let template = RequestTemplate::post(
        mkfile_path(session, size),
        UpPurpose::Chunked,
        UpType::Mkfile,
    )
    .header("Authorization", session.token.authorization())
    .header("Content-Type", "text/plain")
    .body(Body::Bytes(Bytes::from(contexts.join(","))))
    .total_size(size);
    let delivery = session
        .manager
        .transport()
        .send(session.regions, &template, Some(session.token))
        .await?;

    debug!(host = %delivery.endpoint, blocks = contexts.len(), "Chunked upload finalized");
    UploadResponse::from_slice(&delivery.response.body)
}

struct ChunkedUpload<'s, 'a> {
    session: &'s UploadSession<'a>,
    size: u64,
    block_size: u64,
    record_id: Option<String>,
    fingerprint: Fingerprint,
}

impl<'s, 'a> ChunkedUpload<'s, 'a> {
    fn new(session: &'s UploadSession<'a>, size: u64) -> Result<Self> {
        let block_size = session.manager.config().chunk_size();
        let (record_id, fingerprint) = match session.source {
            UploadSource::File(path) => (
                Some(record_id(path, session.params.key.as_deref())),
                Fingerprint::of_file(path, block_size)?,
            ),
            UploadSource::Bytes(_) | UploadSource::Stream(_) => (
                None,
                Fingerprint {
                    size,
                    modified: 0,
                    block_size,
                },
            ),
        };
        Ok(Self {
            session,
            size,
            block_size,
            record_id,
            fingerprint,
        })
    }

    async fn run(&self, fresh: bool) -> Result<UploadResponse> {
        let clock = self.session.manager.clock();
        let plan = plan_blocks(self.size, self.block_size);
        let mut record = self.load_record(fresh);
        record.drop_expired(clock.now_secs());
        self.session.progress.report(record.uploaded_bytes());

        let mut passes = 0;
        loop {
            let expired = record.drop_expired(clock.now_secs());
            if expired > 0 {
                debug!(expired = expired, "Re-uploading expired blocks");
            }
            let missing: Vec<PlannedBlock> = plan
                .iter()
                .filter(|part| !record.has_block(part.index))
                .copied()
                .collect();
            if missing.is_empty() {
                break;
            }
            if passes == MAX_BLOCK_PASSES {
                return Err(UploadError::Integrity(
                    "Blocks expired before the upload could be finalized".to_string(),
                ));
            }
            passes += 1;
            self.upload_blocks(&mut record, missing).await?;
        }

        let response = self.finalize(&record, &plan).await?;
        self.discard_record();
        Ok(response)
    }

    /// A stale or unreadable record is replaced by an empty one
    fn load_record(&self, fresh: bool) -> UploadSessionRecord {
        let now = self.session.manager.clock().now();
        let Some(id) = &self.record_id else {
            return UploadSessionRecord::new(String::new(), self.fingerprint, now);
        };
        if fresh {
            return UploadSessionRecord::new(id.clone(), self.fingerprint, now);
        }

        match self.session.manager.records().load(id) {
            Ok(Some(record)) if record.fingerprint == self.fingerprint => {
                info!(record = %id, blocks = record.blocks.len(), "Resuming chunked upload");
                record
            }
            Ok(Some(_)) => {
                debug!(record = %id, "Source changed since the last attempt, starting over");
                self.discard_record();
                UploadSessionRecord::new(id.clone(), self.fingerprint, now)
            }
            Ok(None) => UploadSessionRecord::new(id.clone(), self.fingerprint, now),
            Err(e) => {
                warn!(record = %id, error = %e, "Failed to load upload record");
                UploadSessionRecord::new(id.clone(), self.fingerprint, now)
            }
        }
    }

    fn save_record(&self, record: &UploadSessionRecord) {
        if self.record_id.is_none() {
            return;
        }
        if let Err(e) = self.session.manager.records().save(record) {
            warn!(record = %record.id, error = %e, "Failed to save upload record");
        }
    }

    fn discard_record(&self) {
        let Some(id) = &self.record_id else {
            return;
        };
        if let Err(e) = self.session.manager.records().delete(id) {
            warn!(record = %id, error = %e, "Failed to delete upload record");
        }
    }

    /// Uploads `missing` with one worker plus whatever permits are free right now
    async fn upload_blocks(
        &self,
        record: &mut UploadSessionRecord,
        missing: Vec<PlannedBlock>,
    ) -> Result<()> {
        let borrowed = borrow_permits(
            self.session.manager.permits(),
            self.session.max_concurrency - 1,
        );
        let workers = 1 + borrowed.len();
        debug!(blocks = missing.len(), workers = workers, "Uploading blocks");

        let mut results = stream::iter(missing.into_iter().map(|part| self.upload_block(part)))
            .buffer_unordered(workers);
        while let Some(result) = results.next().await {
            let block = result?;
            self.session.progress.add(block.size);
            record.push_block(block, self.session.manager.clock().now());
            self.save_record(record);
        }
        drop(borrowed);
        Ok(())
    }

    async fn upload_block(&self, part: PlannedBlock) -> Result<Block> {
        let data = self
            .session
            .source
            .read_range(part.offset, part.size)
            .await?;
        send_block(self.session, part, data).await
    }

    async fn finalize(
        &self,
        record: &UploadSessionRecord,
        plan: &[PlannedBlock],
    ) -> Result<UploadResponse> {
        let mut contexts = Vec::with_capacity(plan.len());
        for part in plan {
            let block = record
                .blocks
                .iter()
                .find(|block| block.index == part.index)
                .filter(|block| block.offset == part.offset && block.size == part.size)
                .ok_or_else(|| {
                    UploadError::Integrity(format!("Block {} is missing or misplaced", part.index))
                })?;
            contexts.push(block.ctx.as_str());
        }

        make_file(self.session, self.size, &contexts).await
    }
}

fn borrow_permits(permits: &Arc<Semaphore>, wanted: usize) -> Vec<OwnedSemaphorePermit> {
    let mut borrowed = Vec::with_capacity(wanted);
    while borrowed.len() < wanted {
        match Arc::clone(permits).try_acquire_owned() {
            Ok(permit) => borrowed.push(permit),
            Err(_) => break,
        }
    }
    borrowed
}

fn encode(value: &str) -> String {
    URL_SAFE.encode(value.as_bytes())
}

pub(crate) fn mkfile_path(session: &UploadSession<'_>, size: u64) -> String {
    let params = session.params;
    let mut path = format!("/mkfile/{}", size);
    if let Some(key) = &params.key {
        path.push_str(&format!("/key/{}", encode(key)));
    }
    path.push_str(&format!(
        "/fname/{}",
        encode(&params.file_name_for(session.source))
    ));
    path.push_str(&format!(
        "/mimeType/{}",
        encode(params.mime.as_deref().unwrap_or(DEFAULT_MIME))
    ));
    for (name, value) in &params.vars {
        path.push_str(&format!("/x:{}/{}", name, encode(value)));
    }
    for (name, value) in &params.metadata {
        path.push_str(&format!("/x-qn-meta-{}/{}", name, encode(value)));
    }
    path
}
