use std::sync::Arc;

use crate::channel::Channel;

/// Membership-based idle tracking for registered channels.
///
/// The processor adds a channel when it opens and removes it when it
/// closes; deciding what "idle" means and acting on it is the
/// implementation's business. Implementations hold identity only and must
/// not extend channel lifetime beyond these callbacks.
pub trait IdleTimer: Send + Sync {
    fn add(&self, channel: &Arc<Channel>);
    fn remove(&self, channel: &Arc<Channel>);
}

/// Idle tracking disabled.
#[derive(Debug, Default)]
pub struct NoopIdleTimer;

impl IdleTimer for NoopIdleTimer {
    fn add(&self, _channel: &Arc<Channel>) {}

    fn remove(&self, _channel: &Arc<Channel>) {}
}
