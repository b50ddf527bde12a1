//! Transport connection supervision with capped linear backoff.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::BridgeError;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal. No further automatic retries.
    GivenUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempt: u32,
    total_attempts: u64,
    state: watch::Sender<ConnectionState>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            policy,
            attempt: 0,
            total_attempts: 0,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reconnect attempts made over the controller's lifetime.
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    /// Initial connect. A failure enters the same backoff as a dropped connection.
    pub async fn connect(
        &mut self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        self.ensure_not_given_up()?;
        self.state.send_replace(ConnectionState::Connecting);

        match transport.connect().await {
            Ok(()) => {
                self.mark_connected();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "initial connect failed");
                self.recover(transport, cancel).await
            }
        }
    }

    /// Called when the transport reports an unexpected disconnect.
    pub async fn handle_disconnect(
        &mut self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        self.ensure_not_given_up()?;
        self.state.send_replace(ConnectionState::Disconnected);
        self.recover(transport, cancel).await
    }

    async fn recover(
        &mut self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        loop {
            self.attempt += 1;
            if self.attempt > self.policy.max_attempts {
                self.state.send_replace(ConnectionState::GivenUp);
                error!(
                    attempts = self.policy.max_attempts,
                    "giving up on transport reconnection"
                );
                return Err(BridgeError::ReconnectGaveUp {
                    attempts: self.policy.max_attempts,
                });
            }

            let attempt = self.attempt;
            let delay = self.policy.delay_for(attempt);
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
            info!(
                attempt = attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnection scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(BridgeError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.state.send_replace(ConnectionState::Connecting);
            self.total_attempts += 1;
            match transport.connect().await {
                Ok(()) => {
                    info!(attempt = attempt, "reconnected");
                    self.mark_connected();
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "reconnect failed");
                }
            }
        }
    }

    fn mark_connected(&mut self) {
        self.attempt = 0;
        self.state.send_replace(ConnectionState::Connected);
    }

    fn ensure_not_given_up(&self) -> Result<(), BridgeError> {
        if self.state() == ConnectionState::GivenUp {
            return Err(BridgeError::ReconnectGaveUp {
                attempts: self.policy.max_attempts,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::test_support::RecordingTransport;
    use tokio::time::Instant;

    fn refused() -> Result<(), TransportError> {
        Err(TransportError::Connect("refused".into()))
    }

    fn gaps(start: Instant, attempts: &[Instant]) -> Vec<Duration> {
        let mut prev = start;
        attempts
            .iter()
            .map(|t| {
                let gap = t.duration_since(prev);
                prev = *t;
                gap
            })
            .collect()
    }

    #[test]
    fn linear_delays() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn initial_connect_success() {
        let transport = RecordingTransport::new();
        let mut controller = ReconnectController::new(ReconnectPolicy::default());
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        controller
            .connect(&transport, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_linearly_then_reset() {
        let transport = RecordingTransport::new();
        transport.script_connects([refused(), refused()]);
        let mut controller = ReconnectController::new(ReconnectPolicy::default());
        let start = Instant::now();

        controller
            .handle_disconnect(&transport, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            gaps(start, &transport.connect_attempts()),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15)
            ]
        );
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(controller.attempt(), 0);
        assert_eq!(controller.total_attempts(), 3);

        // A later drop starts from the first delay again.
        let again = Instant::now();
        controller
            .handle_disconnect(&transport, &CancellationToken::new())
            .await
            .unwrap();
        let attempts = transport.connect_attempts();
        assert_eq!(
            attempts[attempts.len() - 1].duration_since(again),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_cap() {
        let transport = RecordingTransport::new();
        transport.script_connects(std::iter::repeat_with(refused).take(10));
        let mut controller = ReconnectController::new(ReconnectPolicy::default());
        let mut states = controller.subscribe();
        let start = Instant::now();

        let result = controller
            .handle_disconnect(&transport, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::ReconnectGaveUp { attempts: 5 })
        ));
        assert_eq!(controller.state(), ConnectionState::GivenUp);
        assert_eq!(*states.borrow_and_update(), ConnectionState::GivenUp);
        assert_eq!(
            gaps(start, &transport.connect_attempts()),
            (1..=5).map(|k| Duration::from_secs(5 * k)).collect::<Vec<_>>()
        );

        // Terminal: no further attempts.
        let result = controller
            .handle_disconnect(&transport, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BridgeError::ReconnectGaveUp { .. })));
        assert_eq!(transport.connect_attempts().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_failure_uses_backoff() {
        let transport = RecordingTransport::new();
        transport.script_connects([refused()]);
        let mut controller = ReconnectController::new(ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
        });
        let start = Instant::now();

        controller
            .connect(&transport, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            gaps(start, &transport.connect_attempts()),
            vec![Duration::ZERO, Duration::from_secs(1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let transport = RecordingTransport::new();
        let mut controller = ReconnectController::new(ReconnectPolicy::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = controller.handle_disconnect(&transport, &cancel).await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert!(transport.connect_attempts().is_empty());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }
}
