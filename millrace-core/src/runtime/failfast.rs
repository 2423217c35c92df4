use tracing::debug;

use crate::cancellation::CancelToken;

/// Cancels the run when dropped while still armed.
///
/// Every partition holds one. A partition which fails or panics drops its guard without
/// disarming it, which unblocks all other partitions of the same run.
pub(crate) struct FailFast {
    token: CancelToken,
    partition: usize,
    armed: bool,
}

impl FailFast {
    pub(crate) fn new(token: CancelToken, partition: usize) -> Self {
        Self {
            token,
            partition,
            armed: true,
        }
    }

    /// The partition succeeded, leave the other partitions alone
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FailFast {
    fn drop(&mut self) {
        if self.armed && !self.token.is_cancelled() {
            debug!(partition = self.partition, "Partition failed, cancelling the run");
            self.token.cancel();
        }
    }
}
