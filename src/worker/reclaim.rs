//! Reclamation sweep.
//!
//! Ownership keys carry no TTL; only the heartbeat does. When a worker
//! dies its heartbeat lapses but its owner keys survive, so on startup
//! every worker walks `owner:*`, and for each key whose owner has no live
//! heartbeat and whose stream is still in flight, atomically rewrites the
//! key to itself and resumes the stream. The compare-and-swap keeps two
//! simultaneously starting workers from both adopting the same orphan.

use super::WorkerContext;
use crate::broker::Broker as _;
use crate::events::StreamStatus;
use crate::stream::{self, StreamRecord, heartbeat_key};
use tracing::{debug, info, warn};

pub struct ReclaimedStream {
    pub stream_id: String,
    pub prefix: String,
    /// Reconstructed from the committed chunk counter: the previous owner
    /// is assumed to have applied everything it committed.
    pub resume_last_applied: Option<u64>,
}

pub async fn sweep(ctx: &WorkerContext) -> Vec<ReclaimedStream> {
    let owner_keys = match ctx.broker.keys("owner:*").await {
        Ok(keys) => keys,
        Err(err) => {
            warn!(%err, "reclaim sweep skipped, owner keys unreadable");
            return Vec::new();
        }
    };

    let mut reclaimed = Vec::new();
    for owner_key in owner_keys {
        let Some(stream_id) = owner_key.strip_prefix("owner:").map(str::to_string) else {
            continue;
        };
        match try_reclaim(ctx, &owner_key, &stream_id).await {
            Ok(Some(stream)) => reclaimed.push(stream),
            Ok(None) => {}
            Err(err) => warn!(%stream_id, %err, "reclaim attempt failed"),
        }
    }
    reclaimed
}

async fn try_reclaim(
    ctx: &WorkerContext,
    owner_key: &str,
    stream_id: &str,
) -> Result<Option<ReclaimedStream>, crate::error::PipelineError> {
    let Some(owner) = ctx.broker.get(owner_key).await? else {
        return Ok(None);
    };
    if owner == ctx.worker_id {
        // Our own key from a previous life; fall through and re-adopt.
        debug!(%stream_id, "found own stale ownership");
    } else if ctx.broker.get(&heartbeat_key(&owner)).await?.is_some() {
        // Owner is alive; never steal mid-flight.
        return Ok(None);
    }

    let fields = ctx
        .broker
        .hash_get_all(&stream::state_key(stream_id))
        .await?;
    let record = match StreamRecord::from_fields(&fields) {
        Some(Ok(record)) => record,
        Some(Err(err)) => {
            warn!(%stream_id, %err, "orphaned stream state unreadable, leaving it");
            return Ok(None);
        }
        None => {
            // State already expired; the owner key is pure debris.
            info!(%stream_id, "deleting ownership of an expired stream");
            ctx.broker.delete(owner_key).await?;
            return Ok(None);
        }
    };
    if !matches!(record.status, StreamStatus::Live | StreamStatus::Ending) {
        debug!(%stream_id, status = %record.status, "stream not in flight, skipping");
        return Ok(None);
    }

    let swapped = ctx
        .broker
        .swap_if_equals(owner_key, &owner, &ctx.worker_id)
        .await
        .map_err(|err| crate::error::PipelineError::Ownership {
            stream_id: stream_id.to_string(),
            detail: err.to_string(),
        })?;
    if !swapped {
        // Another sweeper got there first.
        return Ok(None);
    }

    info!(
        %stream_id,
        previous_owner = %owner,
        chunk_count = record.chunk_count,
        "stream reclaimed"
    );
    Ok(Some(ReclaimedStream {
        stream_id: stream_id.to_string(),
        prefix: record.prefix,
        resume_last_applied: record.chunk_count.checked_sub(1),
    }))
}
