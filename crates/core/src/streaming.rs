use crate::models::FlushPolicy;
use std::time::Instant;

pub trait Clock {
    fn now(&self) -> Instant;
}

/// Reads the tokio clock, so paused test time applies to the buffer too.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Accumulating,
    Flushing,
}

/// Batches streamed fragments into outbound messages.
///
/// Driven by two signals: [`StreamBuffer::fragment_received`] and
/// [`StreamBuffer::tick`]. A batch is released once it holds at least
/// `max_chars` characters, or once `max_interval` has passed since the last
/// delivery and the buffer is not empty.
///
/// Releasing a batch moves the buffer to [`StreamState::Flushing`]. Fragments
/// keep accumulating there, but nothing else is released until the caller
/// reports the batch as sent with [`StreamBuffer::delivered`].
#[derive(Debug)]
pub struct StreamBuffer<C: Clock = SystemClock> {
    clock: C,
    policy: FlushPolicy,
    buffer: String,
    buffered_chars: usize,
    last_flush: Instant,
    state: StreamState,
}

impl StreamBuffer<SystemClock> {
    pub fn new(policy: FlushPolicy) -> Self {
        Self::with_clock(policy, SystemClock)
    }
}

impl<C: Clock> StreamBuffer<C> {
    pub fn with_clock(policy: FlushPolicy, clock: C) -> Self {
        let last_flush = clock.now();
        Self {
            clock,
            policy,
            buffer: String::new(),
            buffered_chars: 0,
            last_flush,
            state: StreamState::Accumulating,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn fragment_received(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        self.buffered_chars += fragment.chars().count();
        self.advance()
    }

    pub fn tick(&mut self) -> Option<String> {
        self.advance()
    }

    /// Releases whatever is left once the stream has ended, even while an
    /// earlier batch is still unacknowledged.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.release())
    }

    /// The released batch was sent; the interval restarts from now.
    pub fn delivered(&mut self) {
        if self.state == StreamState::Flushing {
            self.state = StreamState::Accumulating;
            self.last_flush = self.clock.now();
        }
    }

    fn advance(&mut self) -> Option<String> {
        if self.state == StreamState::Flushing || self.buffer.is_empty() {
            return None;
        }

        let size_reached = self.buffered_chars >= self.policy.max_chars;
        let interval_reached =
            self.clock.now().duration_since(self.last_flush) >= self.policy.max_interval;

        if size_reached || interval_reached {
            return Some(self.release());
        }
        None
    }

    fn release(&mut self) -> String {
        self.state = StreamState::Flushing;
        self.buffered_chars = 0;
        std::mem::take(&mut self.buffer)
    }
}
