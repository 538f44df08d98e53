use core::time::Duration;

/// The scheduler's sleep primitive, as seen by code that must back off and retry.
pub trait Timer: Send + Sync {
    /// Blocks the calling thread for at least `duration`.
    fn sleep(&self, duration: Duration);
}
