use crate::board::Board;
use crate::stats::StatsStore;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why a light sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEnd {
    Elapsed,
    Button,
    Shutdown,
}

/// Low-power wait between readings that keeps counting rain.
///
/// Polls the board every `tick`; each rising edge on the rain input is one
/// bucket tip. Tips are written out at most one flush interval late.
#[derive(Debug, Clone, Copy)]
pub struct LightSleep {
    tick: Duration,
}

impl LightSleep {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    pub async fn sleep<B: Board>(
        &self,
        duration: Duration,
        board: &mut B,
        stats: &mut StatsStore,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SleepEnd {
        debug!("Sleeping for {}s", duration.as_secs());

        let deadline = Instant::now() + duration;
        // Level at entry is the baseline, a gauge resting closed is not a tip.
        let mut rain_level = board.rain_triggered();
        let mut tips = 0u32;

        let end = loop {
            if *shutdown.borrow() {
                break SleepEnd::Shutdown;
            }

            let now = Instant::now();
            if now >= deadline {
                break SleepEnd::Elapsed;
            }
            let step = self.tick.min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown signal received during sleep");
                    break SleepEnd::Shutdown;
                }
            }

            let level = board.rain_triggered();
            if level && !rain_level {
                stats.record_rain_tick();
                tips += 1;
            }
            rain_level = level;

            if let Err(e) = stats.flush_if_due() {
                warn!("Failed to persist daily stats during sleep: {}", e);
            }

            if board.button_pressed() {
                info!("Button pressed, waking early");
                break SleepEnd::Button;
            }
        };

        if tips > 0 {
            debug!("Counted {} rain tip(s) while asleep", tips);
        }
        if let Err(e) = stats.flush(true) {
            error!("Failed to persist daily stats after sleep: {}", e);
        }

        end
    }
}
