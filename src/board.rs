use crate::error::Result;
use crate::fusion::RawSample;

/// Hardware the node reads from.
#[allow(async_fn_in_trait)]
pub trait Board {
    /// Takes one set of sensor readings. `None` means there are no more
    /// samples and the node should stop.
    async fn sample(&mut self) -> Result<Option<RawSample>>;

    /// Current level of the rain gauge input.
    fn rain_triggered(&mut self) -> bool;

    /// True while the wake button is held.
    fn button_pressed(&mut self) -> bool;

    /// Rain tips counted by the board itself since the last call.
    fn take_pending_rain_tips(&mut self) -> u32 {
        0
    }
}
