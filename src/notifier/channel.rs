//! In-process notifier built on a tokio broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Notifier;
use crate::storage::{Result, WrittenEvent};

/// Fan-out of committed writes to watchers in the same process.
///
/// Each watcher gets a bounded buffer of `buffer_size` events. When a watcher
/// falls that far behind, the next event for it is dropped and its stream is
/// closed.
pub struct ChannelNotifier {
    sender: broadcast::Sender<WrittenEvent>,
    buffer_size: usize,
    shutdown: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl ChannelNotifier {
    pub fn new(buffer_size: usize, shutdown: CancellationToken) -> Self {
        let buffer_size = buffer_size.max(1);
        let (sender, _) = broadcast::channel(buffer_size);

        info!(buffer_size, "Channel notifier initialized");

        Self {
            sender,
            buffer_size,
            shutdown,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Events dropped across all watchers since construction.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn record_dropped(dropped: &AtomicU64, count: u64) {
    dropped.fetch_add(count, Ordering::Relaxed);

    #[cfg(feature = "otel")]
    {
        use crate::utils::metrics::{self, WATCH_DROPPED_TOTAL};
        WATCH_DROPPED_TOTAL.add(count, &[metrics::notifier_attr("channel")]);
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    fn send(&self, event: WrittenEvent) {
        let rv = event.resource_version;
        // Err only means no watcher is subscribed.
        if let Ok(receivers) = self.sender.send(event) {
            trace!(rv, receivers, "Published write event");
        }
    }

    async fn notify(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<WrittenEvent>> {
        let mut events = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let shutdown = self.shutdown.clone();
        let dropped = self.dropped.clone();

        tokio::spawn(async move {
            debug!("Watch stream opened");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    received = events.recv() => match received {
                        Ok(event) => match tx.try_send(event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(event)) => {
                                warn!(
                                    rv = event.resource_version,
                                    key = %event.key,
                                    "Watcher buffer full, dropping event and closing stream"
                                );
                                record_dropped(&dropped, 1);
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Watcher lagged, closing stream");
                            record_dropped(&dropped, skipped);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Watch stream closed");
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
