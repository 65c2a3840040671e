use tracing::debug;

/// Network link used for uploads and clock sync.
///
/// Bringing the link up is expensive, so callers hold it only for the
/// duration of one upload run and always call `disconnect` afterwards.
#[allow(async_fn_in_trait)]
pub trait Connectivity {
    /// Brings the link up. Returns false if it could not be established.
    async fn connect(&mut self) -> bool;

    fn disconnect(&mut self);

    /// Last known signal strength in dBm.
    fn signal_strength(&self) -> Option<i32> {
        None
    }

    /// Sets the clock from a network time source. Returns true on success.
    async fn sync_clock(&mut self) -> bool;
}

/// Link for a node running on a host OS, which owns Wi-Fi and NTP itself.
#[derive(Debug, Default)]
pub struct HostNetwork {
    connected: bool,
}

impl HostNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connectivity for HostNetwork {
    async fn connect(&mut self) -> bool {
        self.connected = true;
        debug!("Network up");
        true
    }

    fn disconnect(&mut self) {
        if self.connected {
            debug!("Network down");
        }
        self.connected = false;
    }

    async fn sync_clock(&mut self) -> bool {
        true
    }
}
