//! Delayed deletion of temporary notice and payment channels.
//!
//! Each scheduled teardown is an owned, cancellable task keyed by the
//! channel it will delete. Current flows never cancel one: a teardown
//! firing after the member already renewed just deletes a channel
//! nobody reads anymore, and deleting an already-gone channel is a
//! directory-level no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use portaria_shared::ChannelId;

use crate::directory::Directory;

pub struct ScheduledTeardowns {
    directory: Arc<dyn Directory>,
    tasks: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
}

impl ScheduledTeardowns {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<ChannelId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedules the channel for deletion after `after`. Re-scheduling
    /// replaces the pending timer so a channel never carries two.
    pub fn schedule(self: &Arc<Self>, channel: ChannelId, after: Duration) {
        debug!(channel = channel.0, after_secs = after.as_secs(), "Channel teardown scheduled");
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Err(e) = registry.directory.delete_channel(channel).await {
                warn!(channel = channel.0, error = %e, "Channel teardown failed");
            }
            registry.locked().remove(&channel);
        });
        if let Some(previous) = self.locked().insert(channel, handle) {
            previous.abort();
        }
    }

    /// Cancels a pending teardown. No current flow calls this; it exists
    /// so renewal could one day keep a still-relevant channel alive.
    pub fn cancel(&self, channel: ChannelId) {
        if let Some(handle) = self.locked().remove(&channel) {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.locked().len()
    }
}
