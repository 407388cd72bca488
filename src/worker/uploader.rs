//! Output uploader.
//!
//! Polls the muxer's scratch directory, ships finished segments to object
//! storage, and refreshes the playlist. Two rules keep playback honest:
//! a segment is only taken once it has sat unmodified for the quiescence
//! interval (the muxer writes in place), and within any one cycle every
//! segment is processed before the manifest, so an uploaded playlist never
//! names a segment that is not already durable.

use crate::broker::{Broker as _, BrokerHandle};
use crate::events::ProgressEvent;
use crate::keys;
use crate::storage::ObjectStore;
use crate::stream::events_channel;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MANIFEST_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";
/// Breather between noticing a manifest rewrite and reading it, so a
/// mid-rewrite playlist is not shipped.
const MANIFEST_SETTLE: Duration = Duration::from_millis(100);

pub struct OutputUploader {
    stream_id: String,
    prefix: String,
    dir: PathBuf,
    store: Arc<ObjectStore>,
    broker: BrokerHandle,
    quiescence: Duration,
    uploaded: HashSet<String>,
    manifest_mtime: Option<SystemTime>,
    total_bytes: u64,
}

impl OutputUploader {
    pub fn new(
        stream_id: String,
        prefix: String,
        dir: PathBuf,
        store: Arc<ObjectStore>,
        broker: BrokerHandle,
        quiescence: Duration,
    ) -> Self {
        Self {
            stream_id,
            prefix,
            dir,
            store,
            broker,
            quiescence,
            uploaded: HashSet::new(),
            manifest_mtime: None,
            total_bytes: 0,
        }
    }

    /// Polls until cancelled, then hands the accumulated state back to the
    /// finalizer for its last sweep.
    pub async fn run(mut self, poll_interval: Duration, cancel: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_cycle(false).await,
            }
        }
        self
    }

    /// Runs after the muxer has exited: no quiescence needed, every file
    /// is final.
    pub async fn final_sweep(&mut self) {
        self.poll_cycle(true).await;
    }

    pub fn segment_count(&self) -> u64 {
        self.uploaded.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) async fn poll_cycle(&mut self, force: bool) {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(err) => {
                debug!(dir = %self.dir.display(), %err, "output directory not readable yet");
                return;
            }
        };

        let mut segments = Vec::new();
        let mut manifest = None;
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name == keys::MANIFEST_NAME {
                        manifest = Some(entry.path());
                    } else if name.ends_with(".ts") && !self.uploaded.contains(&name) {
                        segments.push((name, entry.path()));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "output directory scan interrupted");
                    break;
                }
            }
        }

        for (name, path) in segments {
            self.try_upload_segment(&name, &path, force).await;
        }
        if let Some(path) = manifest {
            self.maybe_upload_manifest(&path, force).await;
        }
    }

    async fn try_upload_segment(&mut self, name: &str, path: &Path, force: bool) {
        if !force {
            let Ok(meta) = tokio::fs::metadata(path).await else {
                return;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.quiescence {
                // Still being written; the next cycle picks it up.
                return;
            }
        }

        let key = keys::hls_key(&self.prefix, &self.stream_id, name);
        match self
            .store
            .put_file(&key, path, SEGMENT_CONTENT_TYPE, None)
            .await
        {
            Ok(written) => {
                self.uploaded.insert(name.to_string());
                self.total_bytes += written;
                info!(stream_id = %self.stream_id, %name, written, "segment uploaded");
                self.publish(ProgressEvent::SegmentReady {
                    stream_id: self.stream_id.clone(),
                    name: name.to_string(),
                    size: written,
                })
                .await;
            }
            Err(err) => {
                // Left unmarked so the next poll cycle retries.
                warn!(stream_id = %self.stream_id, %name, %err, "segment upload failed");
            }
        }
    }

    async fn maybe_upload_manifest(&mut self, path: &Path, force: bool) {
        let modified = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok());
        if !force {
            if modified.is_none() || modified == self.manifest_mtime {
                return;
            }
            tokio::time::sleep(MANIFEST_SETTLE).await;
        }

        let key = keys::manifest_key(&self.prefix, &self.stream_id);
        match self
            .store
            .put_file(
                &key,
                path,
                MANIFEST_CONTENT_TYPE,
                Some(MANIFEST_CACHE_CONTROL),
            )
            .await
        {
            Ok(_) => {
                self.manifest_mtime = modified;
                debug!(stream_id = %self.stream_id, %key, "manifest uploaded");
                self.publish(ProgressEvent::ManifestUpdated {
                    stream_id: self.stream_id.clone(),
                    key,
                })
                .await;
            }
            Err(err) => {
                warn!(stream_id = %self.stream_id, %err, "manifest upload failed");
            }
        }
    }

    async fn publish(&self, event: ProgressEvent) {
        let channel = events_channel(&self.stream_id);
        if let Err(err) = self.broker.publish(&channel, &event.to_json()).await {
            warn!(stream_id = %self.stream_id, %err, "progress publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::storage::StorageBackend;
    use crate::stream::EVENTS_PATTERN;

    struct Fixture {
        uploader: OutputUploader,
        events: tokio::sync::mpsc::UnboundedReceiver<(String, String)>,
        store: ObjectStore,
        out_dir: tempfile::TempDir,
        _bucket_dir: tempfile::TempDir,
    }

    async fn fixture(quiescence: Duration) -> Fixture {
        let bucket_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(&StorageBackend::Local {
            root: bucket_dir.path().to_path_buf(),
        })
        .unwrap();
        let broker: BrokerHandle = Arc::new(MemoryBroker::new());
        let events = broker.subscribe(EVENTS_PATTERN).await.unwrap();

        let uploader = OutputUploader::new(
            "s1".into(),
            "recordings/2025/03/07".into(),
            out_dir.path().to_path_buf(),
            Arc::new(store.clone()),
            broker,
            quiescence,
        );
        Fixture {
            uploader,
            events,
            store,
            out_dir,
            _bucket_dir: bucket_dir,
        }
    }

    fn drain_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<(String, String)>,
    ) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok((_, payload)) = rx.try_recv() {
            events.push(ProgressEvent::parse(&payload).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn quiescent_segments_upload_before_the_manifest() {
        let mut fx = fixture(Duration::from_millis(40)).await;
        std::fs::write(fx.out_dir.path().join("segment_00000.ts"), vec![1u8; 64]).unwrap();
        std::fs::write(fx.out_dir.path().join("segment_00001.ts"), vec![2u8; 32]).unwrap();
        std::fs::write(fx.out_dir.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        fx.uploader.poll_cycle(false).await;

        let events = drain_events(&mut fx.events);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProgressEvent::SegmentReady { .. }));
        assert!(matches!(events[1], ProgressEvent::SegmentReady { .. }));
        assert!(matches!(events[2], ProgressEvent::ManifestUpdated { .. }));

        assert_eq!(fx.uploader.segment_count(), 2);
        assert_eq!(fx.uploader.total_bytes(), 96);
        assert!(
            fx.store
                .exists("recordings/2025/03/07/s1/hls/segment_00000.ts")
                .await
                .unwrap()
        );
        assert!(
            fx.store
                .exists("recordings/2025/03/07/s1/hls/stream.m3u8")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn fresh_segments_wait_for_quiescence() {
        let mut fx = fixture(Duration::from_secs(5)).await;
        std::fs::write(fx.out_dir.path().join("segment_00000.ts"), vec![1u8; 64]).unwrap();

        fx.uploader.poll_cycle(false).await;
        assert_eq!(fx.uploader.segment_count(), 0);
        assert!(drain_events(&mut fx.events).is_empty());

        // The final sweep ignores quiescence.
        fx.uploader.final_sweep().await;
        assert_eq!(fx.uploader.segment_count(), 1);
    }

    #[tokio::test]
    async fn uploaded_segments_are_not_re_announced() {
        let mut fx = fixture(Duration::ZERO).await;
        std::fs::write(fx.out_dir.path().join("segment_00000.ts"), vec![1u8; 64]).unwrap();

        fx.uploader.poll_cycle(false).await;
        assert_eq!(drain_events(&mut fx.events).len(), 1);

        // Second cycle and an overlapping final sweep: same object, no
        // duplicate SegmentReady.
        fx.uploader.poll_cycle(false).await;
        fx.uploader.final_sweep().await;
        assert!(drain_events(&mut fx.events).is_empty());
        assert_eq!(fx.uploader.segment_count(), 1);
        assert_eq!(fx.uploader.total_bytes(), 64);
    }

    #[tokio::test]
    async fn manifest_reuploads_only_on_mtime_change() {
        let mut fx = fixture(Duration::ZERO).await;
        let manifest = fx.out_dir.path().join("stream.m3u8");
        std::fs::write(&manifest, "#EXTM3U\n").unwrap();

        fx.uploader.poll_cycle(false).await;
        assert_eq!(drain_events(&mut fx.events).len(), 1);

        // Unchanged manifest: nothing to publish.
        fx.uploader.poll_cycle(false).await;
        assert!(drain_events(&mut fx.events).is_empty());

        // Rewritten manifest gets shipped again.
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&manifest, "#EXTM3U\n#EXTINF:4.0,\nsegment_00000.ts\n").unwrap();
        fx.uploader.poll_cycle(false).await;
        let events = drain_events(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProgressEvent::ManifestUpdated { .. }));
    }

    #[tokio::test]
    async fn non_media_files_are_ignored() {
        let mut fx = fixture(Duration::ZERO).await;
        std::fs::write(fx.out_dir.path().join("segment_00000.ts.tmp"), b"partial").unwrap();
        std::fs::write(fx.out_dir.path().join("notes.txt"), b"junk").unwrap();

        fx.uploader.poll_cycle(false).await;
        assert_eq!(fx.uploader.segment_count(), 0);
        assert!(drain_events(&mut fx.events).is_empty());
    }
}
