//! Wake-cycle orchestration.
//!
//! Each cycle resumes unfinished uploads, keeps the clock in sync, takes
//! one reading and delivers it, then light-sleeps until the next reading.

use crate::board::Board;
use crate::clock::SharedClock;
use crate::config::{Config, DeviceConfig};
use crate::destination::{Destination, DestinationKind};
use crate::error::Result;
use crate::fusion::{RawSample, SensorFusion};
use crate::markers::{ClockSyncMarker, LastReadingMarker};
use crate::network::Connectivity;
use crate::pipeline::UploadPipeline;
use crate::reading::Reading;
use crate::readings_log::ReadingsLog;
use crate::sleep::{LightSleep, SleepEnd};
use crate::stats::{DailyStats, StatsStore};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Where readings go after fusion.
pub enum Delivery<D: Destination> {
    Upload(UploadPipeline<D>),
    /// No destination configured; readings are kept on disk.
    LocalLog(ReadingsLog),
}

impl Delivery<DestinationKind> {
    pub fn from_config(config: &Config, clock: SharedClock) -> Result<Self> {
        Ok(match UploadPipeline::from_config(config, clock)? {
            Some(pipeline) => Delivery::Upload(pipeline),
            None => {
                info!("No upload destination configured, logging readings locally");
                Delivery::LocalLog(ReadingsLog::new(config.storage.readings_dir()))
            }
        })
    }
}

pub struct Node<B: Board, N: Connectivity, D: Destination = DestinationKind> {
    board: B,
    network: N,
    delivery: Delivery<D>,
    device: DeviceConfig,
    stats: StatsStore,
    fusion: SensorFusion,
    clock: SharedClock,
    clock_sync: ClockSyncMarker,
    last_reading: LastReadingMarker,
    sleeper: LightSleep,
    reading_interval: Duration,
    resync_hours: u64,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: Board, N: Connectivity, D: Destination> Node<B, N, D> {
    pub fn new(
        config: &Config,
        clock: SharedClock,
        board: B,
        network: N,
        delivery: Delivery<D>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let storage = &config.storage;
        let stats = StatsStore::new(
            storage.daily_stats_file(),
            clock.clone(),
            config.calibration.rain_mm_per_tick,
            config.smoothing.clone(),
            config.retention.clone(),
        );

        Self {
            board,
            network,
            delivery,
            device: config.device.clone(),
            stats,
            fusion: SensorFusion::new(&config.calibration),
            clock,
            clock_sync: ClockSyncMarker::new(storage.sync_time_file()),
            last_reading: LastReadingMarker::new(storage.last_time_file()),
            sleeper: LightSleep::new(Duration::from_millis(config.schedule.sleep_tick_ms)),
            reading_interval: Duration::from_secs(config.schedule.reading_frequency_minutes * 60),
            resync_hours: config.schedule.resync_frequency_hours,
            shutdown_rx,
        }
    }

    /// Today's statistics as the node currently sees them.
    pub fn daily_stats(&mut self) -> &DailyStats {
        self.stats.load()
    }

    /// Runs wake cycles until shutdown or until the board runs out of samples.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Node starting: reading every {}m",
            self.reading_interval.as_secs() / 60
        );

        if let Delivery::Upload(pipeline) = &self.delivery {
            if let Err(e) = pipeline.announce(&mut self.network, &self.device).await {
                warn!("Startup announcement failed: {}", e);
            }
        }

        loop {
            if *self.shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping node");
                break;
            }

            if !self.wake().await? {
                info!("Board has no more samples, stopping node");
                break;
            }

            let end = self
                .sleeper
                .sleep(
                    self.reading_interval,
                    &mut self.board,
                    &mut self.stats,
                    &mut self.shutdown_rx,
                )
                .await;
            if end == SleepEnd::Shutdown {
                info!("Shutdown signal received, stopping node");
                break;
            }
        }

        self.stats.flush(true)
    }

    /// One wake cycle. Returns false when the board has no sample to give.
    pub async fn wake(&mut self) -> Result<bool> {
        self.resume_uploads().await;
        self.check_clock().await;

        let Some(sample) = self.board.sample().await? else {
            return Ok(false);
        };
        let reading = self.take_reading(&sample);
        self.deliver(reading).await;

        Ok(true)
    }

    async fn resume_uploads(&mut self) {
        let Delivery::Upload(pipeline) = &self.delivery else {
            return;
        };

        match pipeline.resume_pending(&mut self.network).await {
            Ok(Some(report)) => info!(
                "Resumed uploads: {} uploaded, {} still deferred",
                report.uploaded, report.deferred
            ),
            Ok(None) => {}
            Err(e) => error!("Resuming uploads failed: {}", e),
        }
    }

    async fn check_clock(&mut self) {
        if self.clock_sync.is_fresh(self.clock.now(), self.resync_hours) {
            return;
        }

        info!("Syncing clock");
        let synced = self.network.connect().await && self.network.sync_clock().await;
        self.network.disconnect();

        if !synced {
            warn!("Clock sync failed, will retry next wake");
            return;
        }
        if let Err(e) = self.clock_sync.record(self.clock.now()) {
            error!("Failed to record clock sync time: {}", e);
        }
    }

    fn take_reading(&mut self, sample: &RawSample) -> Reading {
        let now = self.clock.now();

        let tips = self.board.take_pending_rain_tips();
        for _ in 0..tips {
            self.stats.record_rain_tick();
        }
        if tips > 0 {
            debug!("Board reported {} rain tip(s)", tips);
        }

        let seconds_since_last = self.last_reading.seconds_since(now);
        let reading = self.fusion.fuse(&mut self.stats, sample, seconds_since_last);

        if let Err(e) = self.last_reading.record(now) {
            warn!("Failed to record reading time: {}", e);
        }
        reading
    }

    async fn deliver(&mut self, reading: Reading) {
        match &self.delivery {
            Delivery::LocalLog(log) => {
                if let Err(e) = log.append(self.clock.now(), &reading) {
                    error!("Failed to log reading: {}", e);
                }
            }
            Delivery::Upload(pipeline) => {
                // Persist before the link comes up, uploads can take a while.
                if let Err(e) = self.stats.flush(true) {
                    warn!("Failed to persist daily stats before upload: {}", e);
                }

                let result = if pipeline.is_upload_on_demand() {
                    pipeline
                        .upload_now(&mut self.network, reading)
                        .await
                        .map(|_| ())
                } else {
                    pipeline
                        .defer_upload(&mut self.network, reading)
                        .await
                        .map(|_| ())
                };

                if let Err(e) = result {
                    error!("Upload error: {}", e);
                }
            }
        }
    }
}
