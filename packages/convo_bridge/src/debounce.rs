//! Per-user debounce buffer.
//!
//! The buffer is owned by a single session task. Every append replaces the
//! flush timer; a timer is identified by a sequence number so a fire that
//! raced with a newer append (or a reset) can be recognised and ignored.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct FlushTimer {
    seq: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct MessageBuffer {
    fragments: Vec<String>,
    last_update: Option<Instant>,
    timer: Option<FlushTimer>,
    next_seq: u64,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and (re)arm the flush timer.
    ///
    /// `on_fire` runs after `delay` unless the timer is replaced or reset
    /// first. Returns the sequence number of the new timer.
    pub fn append<F, Fut>(&mut self, text: impl Into<String>, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push(text);
        self.arm(delay, on_fire)
    }

    /// Append without touching the timer.
    pub fn push(&mut self, text: impl Into<String>) {
        self.fragments.push(text.into());
        self.last_update = Some(Instant::now());
    }

    fn arm<F, Fut>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();

        self.next_seq += 1;
        let seq = self.next_seq;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => on_fire(seq).await,
            }
        });
        self.timer = Some(FlushTimer { seq, cancel });
        seq
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
    }

    /// Whether `seq` names the live timer.
    pub fn is_current(&self, seq: u64) -> bool {
        self.timer.as_ref().is_some_and(|t| t.seq == seq)
    }

    /// Consume a timer fire. Returns false for a stale timer.
    pub fn acknowledge_fire(&mut self, seq: u64) -> bool {
        if self.is_current(seq) {
            self.timer = None;
            true
        } else {
            false
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Take everything buffered as one request, disarming the timer.
    ///
    /// Returns `None` when nothing with content is buffered.
    pub fn take_combined(&mut self) -> Option<String> {
        self.disarm();
        let fragments = std::mem::take(&mut self.fragments);
        let combined = combine(&fragments);
        if combined.is_empty() {
            None
        } else {
            Some(combined)
        }
    }

    /// Discard fragments and cancel the timer.
    pub fn reset(&mut self) {
        self.disarm();
        self.fragments.clear();
        self.last_update = None;
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Join fragments in arrival order with single spaces. Blank fragments are dropped.
pub fn combine<S: AsRef<str>>(fragments: &[S]) -> String {
    fragments
        .iter()
        .map(|f| f.as_ref().trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
