//! Store-and-forward delivery of readings.
//!
//! Readings are either sent straight away (batch size 1) or written to the
//! [`UploadQueue`] and drained once enough have piled up. Queue entries are
//! only deleted after the primary destination confirms them.

use crate::clock::SharedClock;
use crate::config::{Config, DeviceConfig};
use crate::destination::{Destination, DestinationKind, UploadOutcome};
use crate::error::{AppError, Result};
use crate::markers::{ClockSyncMarker, ReattemptFlag};
use crate::network::Connectivity;
use crate::queue::{QueueEntry, UploadQueue};
use crate::reading::{Payload, PayloadBuilder, Reading};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to the items of one upload run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub attempted: usize,
    pub uploaded: usize,
    /// Rate limited or lost sync; kept for a later wake.
    pub deferred: usize,
    pub skipped: usize,
}

pub struct UploadPipeline<D: Destination> {
    primary: D,
    secondary: Option<D>,
    queue: UploadQueue,
    reattempt: ReattemptFlag,
    clock_sync: ClockSyncMarker,
    payloads: PayloadBuilder,
    batch_size: u64,
    backoff: Duration,
}

impl UploadPipeline<DestinationKind> {
    /// Builds the pipeline for the configured destinations, or `None` when
    /// no destination is configured.
    pub fn from_config(config: &Config, clock: SharedClock) -> Result<Option<Self>> {
        let Some(primary_config) = config.upload.destination.as_ref() else {
            return Ok(None);
        };

        let storage = &config.storage;
        let primary = DestinationKind::from_config(primary_config, &config.upload)?;
        let mut pipeline = UploadPipeline::new(
            primary,
            UploadQueue::new(storage.uploads_dir()),
            ReattemptFlag::new(storage.reattempt_flag_file()),
            ClockSyncMarker::new(storage.sync_time_file()),
            PayloadBuilder::new(&config.device, clock),
        )
        .with_batch_size(config.upload.batch_size)
        .with_backoff(Duration::from_millis(config.upload.rate_limit_backoff_ms));

        if let Some(secondary_config) = config.upload.secondary_destination.as_ref() {
            let secondary = DestinationKind::from_config(secondary_config, &config.upload)?;
            pipeline = pipeline.with_secondary(secondary);
        }

        Ok(Some(pipeline))
    }
}

impl<D: Destination> UploadPipeline<D> {
    pub fn new(
        primary: D,
        queue: UploadQueue,
        reattempt: ReattemptFlag,
        clock_sync: ClockSyncMarker,
        payloads: PayloadBuilder,
    ) -> Self {
        Self {
            primary,
            secondary: None,
            queue,
            reattempt,
            clock_sync,
            payloads,
            batch_size: 1,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Pause after a rate-limited or out-of-sync item.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a best-effort mirror. Ignored when it is the same kind as the primary.
    pub fn with_secondary(mut self, secondary: D) -> Self {
        if secondary.kind() == self.primary.kind() {
            warn!(
                "Secondary destination '{}' is the same as the primary, ignoring it",
                secondary.kind()
            );
            return self;
        }
        self.secondary = Some(secondary);
        self
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn reattempt_flag(&self) -> &ReattemptFlag {
        &self.reattempt
    }

    pub fn is_upload_on_demand(&self) -> bool {
        self.batch_size == 1
    }

    /// Sends one reading immediately.
    ///
    /// When the link cannot be brought up or the destination fails, the
    /// reading is queued and the reattempt flag set before the error is
    /// returned, so the next wake retries it.
    pub async fn upload_now<N: Connectivity>(
        &self,
        network: &mut N,
        reading: Reading,
    ) -> Result<UploadReport> {
        let payload = self.payloads.build(reading);

        if let Err(e) = self.connect(network).await {
            self.keep_for_next_wake(&payload)?;
            return Err(e);
        }

        let mut report = UploadReport::default();
        let result = self
            .deliver(payload.clone(), network.signal_strength(), &mut report)
            .await;
        network.disconnect();

        match result {
            Ok(()) => Ok(report),
            Err(e @ AppError::UploadFailed { .. }) => {
                self.keep_for_next_wake(&payload)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Queues a reading, then drains the queue if it has reached the batch size.
    pub async fn defer_upload<N: Connectivity>(
        &self,
        network: &mut N,
        reading: Reading,
    ) -> Result<Option<UploadReport>> {
        let payload = self.payloads.build(reading);
        self.queue.enqueue(&payload)?;
        self.drain_queue_if_threshold_met(network).await
    }

    pub async fn drain_queue_if_threshold_met<N: Connectivity>(
        &self,
        network: &mut N,
    ) -> Result<Option<UploadReport>> {
        let pending = self.queue.count() as u64;
        if pending < self.batch_size {
            debug!(
                "{} cache file(s) pending, waiting until there are {}",
                pending, self.batch_size
            );
            return Ok(None);
        }

        debug!("{} cache file(s) need uploading", pending);
        self.drain_queue(network).await.map(Some)
    }

    /// Attempts every pending queue entry, oldest first.
    ///
    /// Stops at the first `Failed` outcome and returns an error; entries
    /// after it stay queued.
    pub async fn drain_queue<N: Connectivity>(&self, network: &mut N) -> Result<UploadReport> {
        self.connect(network).await?;
        let signal = network.signal_strength();
        let result = self.drain_entries(signal).await;
        network.disconnect();

        match &result {
            Ok(report) => info!(
                "Upload run finished: {} uploaded, {} deferred, {} skipped",
                report.uploaded, report.deferred, report.skipped
            ),
            Err(e) => error!("Upload run aborted: {}", e),
        }
        result
    }

    /// Resumes a previous cycle's unfinished uploads if the reattempt flag is set.
    ///
    /// The flag is cleared once the queue is empty or a drain deferred nothing.
    pub async fn resume_pending<N: Connectivity>(
        &self,
        network: &mut N,
    ) -> Result<Option<UploadReport>> {
        if !self.reattempt.is_set() {
            return Ok(None);
        }

        let pending = self.queue.count();
        if pending == 0 {
            self.reattempt.clear()?;
            return Ok(None);
        }

        info!("{} cache file(s) still to upload", pending);
        let report = self.drain_queue(network).await?;
        if report.deferred == 0 {
            self.reattempt.clear()?;
        }
        Ok(Some(report))
    }

    /// Sends the startup announcement of every destination that has one.
    /// A failed announcement is logged and does not stop the others.
    pub async fn announce<N: Connectivity>(
        &self,
        network: &mut N,
        device: &DeviceConfig,
    ) -> Result<()> {
        let announcing: Vec<&D> = std::iter::once(&self.primary)
            .chain(self.secondary.as_ref())
            .filter(|d| d.announces())
            .collect();
        if announcing.is_empty() {
            return Ok(());
        }

        self.connect(network).await?;
        for destination in announcing {
            if let Err(e) = destination.announce(device).await {
                warn!("Announcement to {} failed: {}", destination.kind(), e);
            }
        }
        network.disconnect();
        Ok(())
    }

    async fn connect<N: Connectivity>(&self, network: &mut N) -> Result<()> {
        if network.connect().await {
            return Ok(());
        }
        network.disconnect();
        error!("Cannot upload readings, network connection failed");
        Err(AppError::Connectivity(format!(
            "could not connect to upload to {}",
            self.primary.kind()
        )))
    }

    async fn drain_entries(&self, signal: Option<i32>) -> Result<UploadReport> {
        let entries = self.queue.list_pending()?;
        let mut report = UploadReport::default();
        if entries.is_empty() {
            return Ok(report);
        }

        self.primary.log_destination();
        for entry in entries {
            match self.queue.load(&entry) {
                Ok(payload) => self.deliver(payload, signal, &mut report).await?,
                Err(e) => self.skip_unreadable(&entry, e, &mut report),
            }
        }
        Ok(report)
    }

    fn skip_unreadable(&self, entry: &QueueEntry, err: AppError, report: &mut UploadReport) {
        warn!("Cannot read queue entry '{}': {}. Skipping file", entry.name, err);
        report.skipped += 1;
    }

    async fn deliver(
        &self,
        mut payload: Payload,
        signal: Option<i32>,
        report: &mut UploadReport,
    ) -> Result<()> {
        payload.wifi_signal = signal;
        report.attempted += 1;

        let destination = self.primary.kind();
        let outcome = self.primary.upload(&payload).await;

        match outcome {
            UploadOutcome::Success => {
                match &payload.source_file {
                    Some(name) => {
                        if let Err(e) = self.queue.remove_named(name) {
                            error!("Uploaded '{}' but could not remove it: {}", name, e);
                        }
                        info!("Uploaded {}", name);
                    }
                    None => info!("Uploaded reading on demand"),
                }
                report.uploaded += 1;
            }
            UploadOutcome::RateLimited | UploadOutcome::LostSync => {
                if outcome == UploadOutcome::LostSync {
                    info!("Cannot upload '{}', clock has drifted out of sync", payload.label());
                    if let Err(e) = self.clock_sync.invalidate() {
                        error!("Failed to invalidate clock sync marker: {}", e);
                    }
                } else {
                    info!("Cannot upload '{}', rate limited", payload.label());
                }
                self.defer(&payload)?;
                report.deferred += 1;
                tokio::time::sleep(self.backoff).await;
            }
            UploadOutcome::SkipFile => {
                warn!(
                    "Cannot upload '{}' to {}. Skipping",
                    payload.label(),
                    destination
                );
                report.skipped += 1;
            }
            UploadOutcome::Failed => {
                error!("Cannot upload '{}' to {}", payload.label(), destination);
                return Err(AppError::UploadFailed {
                    destination: destination.to_string(),
                    reason: format!("'{}' was not accepted", payload.label()),
                });
            }
        }

        self.mirror(&payload).await;
        Ok(())
    }

    /// Keeps a deferred payload for the next wake. On-demand payloads are
    /// queued so they are not lost.
    fn defer(&self, payload: &Payload) -> Result<()> {
        if !payload.is_queued() {
            self.queue.enqueue(payload)?;
        }
        self.reattempt.set()
    }

    fn keep_for_next_wake(&self, payload: &Payload) -> Result<()> {
        info!("Keeping '{}' for the next wake", payload.label());
        self.defer(payload)
    }

    async fn mirror(&self, payload: &Payload) {
        let Some(secondary) = self.secondary.as_ref() else {
            return;
        };

        secondary.log_destination();
        match secondary.upload(payload).await {
            UploadOutcome::Success => {
                info!("Secondary destination accepted '{}'", payload.label())
            }
            outcome => warn!(
                "Secondary destination {} returned {:?} for '{}'",
                secondary.kind(),
                outcome,
                payload.label()
            ),
        }
    }
}
