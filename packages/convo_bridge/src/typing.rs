//! Typing-indicator heartbeat for one outstanding request.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{Transport, UserId};

/// Shortest repeat interval; smaller values are raised to it.
pub const MIN_TYPING_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps a recipient's "typing…" indicator alive until [`stop`](Self::stop).
///
/// `start` signals typing=true right away and then every `interval`.
/// `stop` ends the repetition and signals typing=false exactly once.
pub struct TypingHeartbeat {
    transport: Arc<dyn Transport>,
    recipient: UserId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl TypingHeartbeat {
    /// Start the heartbeat. `parent` cancellation ends the repetition but
    /// the stop signal is still owed by [`stop`](Self::stop).
    pub async fn start(
        transport: Arc<dyn Transport>,
        recipient: UserId,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        if let Err(e) = transport.send_typing(&recipient, true).await {
            warn!(user = %recipient, error = %e, "failed to send typing indicator");
        }

        let cancel = parent.child_token();
        let task = tokio::spawn(repeat(
            transport.clone(),
            recipient.clone(),
            interval.max(MIN_TYPING_INTERVAL),
            cancel.clone(),
        ));

        Self {
            transport,
            recipient,
            cancel,
            task: Some(task),
            stopped: false,
        }
    }

    /// Stop the heartbeat. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();

        // A repeat that is mid-send must land before typing=false does.
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        if let Err(e) = self.transport.send_typing(&self.recipient, false).await {
            warn!(user = %self.recipient, error = %e, "failed to clear typing indicator");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn repeat(
    transport: Arc<dyn Transport>,
    recipient: UserId,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = transport.send_typing(&recipient, true).await {
            debug!(user = %recipient, error = %e, "typing heartbeat send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingTransport, Sent};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn repeats_at_interval_then_stops_once() {
        let transport = Arc::new(RecordingTransport::new());
        let user = UserId::from("alice");
        let root = CancellationToken::new();
        let start = Instant::now();

        let mut heartbeat =
            TypingHeartbeat::start(transport.clone(), user.clone(), Duration::from_secs(5), &root)
                .await;
        tokio::time::sleep(Duration::from_secs(12)).await;
        heartbeat.stop().await;
        heartbeat.stop().await;

        let typing = transport.typing_for(&user);
        assert_eq!(typing, vec![true, true, true, false]);

        let times: Vec<Duration> = transport
            .sent()
            .iter()
            .map(|s| s.at().duration_since(start))
            .collect();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(12),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_the_minimum() {
        let transport = Arc::new(RecordingTransport::new());
        let user = UserId::from("dave");
        let root = CancellationToken::new();

        let mut heartbeat =
            TypingHeartbeat::start(transport.clone(), user.clone(), Duration::ZERO, &root).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        heartbeat.stop().await;

        assert_eq!(transport.typing_for(&user), vec![true, true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_still_owes_one_stop() {
        let transport = Arc::new(RecordingTransport::new());
        let user = UserId::from("bob");
        let root = CancellationToken::new();

        let mut heartbeat =
            TypingHeartbeat::start(transport.clone(), user.clone(), Duration::from_secs(5), &root)
                .await;
        root.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        heartbeat.stop().await;

        assert_eq!(transport.typing_for(&user), vec![true, false]);
        assert!(heartbeat.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_ends_repetition() {
        let transport = Arc::new(RecordingTransport::new());
        let user = UserId::from("carol");
        let root = CancellationToken::new();

        let heartbeat =
            TypingHeartbeat::start(transport.clone(), user.clone(), Duration::from_secs(5), &root)
                .await;
        drop(heartbeat);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.typing_for(&user), vec![true]);
        assert!(matches!(transport.sent()[0], Sent::Typing { typing: true, .. }));
    }
}
