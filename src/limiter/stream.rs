use crate::errors::{FaultError, Result};
use crate::limiter::token_bucket::TokenBucket;
use crate::limiter::StreamCallbacks;
use crate::timer::{TimerEvent, TimerHandle, TimerKind, TimerService};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Refill ticks per second.
pub const SLICES_PER_SECOND: u64 = 16;

/// Interval between refill ticks.
pub const TIME_SLICE: Duration = Duration::from_micros(1_000_000 / SLICES_PER_SECOND);

/// Paces a response body to a fixed rate.
///
/// Incoming chunks accumulate in a buffer; a token bucket holding at most one
/// second of bytes gates how much of it is written out. The bucket starts
/// with a single slice of tokens and gains one slice per tick, so writes are
/// paced from the first byte. Past `max_buffered_data` the producer is
/// paused, and it is resumed once the buffer is back at half of that.
pub struct StreamRateLimiter<C: StreamCallbacks> {
    bytes_per_time_slice: u64,
    bucket: TokenBucket,
    buffer: BytesMut,
    high_watermark: usize,
    low_watermark: usize,
    above_high_watermark: bool,
    waiting_for_token: bool,
    token_timer: Option<TimerHandle>,
    timers: Arc<dyn TimerService>,
    callbacks: C,
    saw_end_stream: bool,
    end_stream_written: bool,
    saw_trailers: bool,
    trailers_released: bool,
}

impl<C: StreamCallbacks> StreamRateLimiter<C> {
    /// `fixed_rate_kbps` is in kilobits per second, so 8 kbps is 1000 bytes
    /// per second.
    pub fn new(
        fixed_rate_kbps: u64,
        max_buffered_data: u64,
        callbacks: C,
        timers: Arc<dyn TimerService>,
    ) -> Result<Self> {
        if fixed_rate_kbps == 0 {
            return Err(FaultError::InvalidRateLimit(
                "fixed_rate_kbps must be positive".to_string(),
            ));
        }
        if max_buffered_data == 0 {
            return Err(FaultError::InvalidRateLimit(
                "max_buffered_data must be positive".to_string(),
            ));
        }

        let bytes_per_second = fixed_rate_kbps.saturating_mul(1000) / 8;
        let bytes_per_time_slice = (bytes_per_second / SLICES_PER_SECOND).max(1);
        let high_watermark = usize::try_from(max_buffered_data).unwrap_or(usize::MAX);

        debug!(
            fixed_rate_kbps,
            bytes_per_time_slice, max_buffered_data, "response rate limiter created"
        );

        Ok(Self {
            bytes_per_time_slice,
            bucket: TokenBucket::new(
                bytes_per_time_slice * SLICES_PER_SECOND,
                bytes_per_time_slice,
                bytes_per_time_slice,
            ),
            buffer: BytesMut::new(),
            high_watermark,
            low_watermark: high_watermark / 2,
            above_high_watermark: false,
            waiting_for_token: false,
            token_timer: None,
            timers,
            callbacks,
            saw_end_stream: false,
            end_stream_written: false,
            saw_trailers: false,
            trailers_released: false,
        })
    }

    /// Accept one chunk of the response body.
    pub fn write_data(&mut self, data: Bytes, end_stream: bool) {
        trace!(
            incoming = data.len(),
            buffered = self.buffer.len(),
            end_stream,
            "limiter: incoming data"
        );
        self.buffer.extend_from_slice(&data);
        self.saw_end_stream |= end_stream;

        if !self.above_high_watermark && self.buffer.len() > self.high_watermark {
            self.above_high_watermark = true;
            debug!(buffered = self.buffer.len(), "limiter: pausing upstream");
            self.callbacks.pause_data();
        }

        if !self.waiting_for_token {
            self.drain();
        }
    }

    /// Note that trailers arrived. Returns true while they must be held back
    /// because buffered data has not been written yet.
    pub fn on_trailers(&mut self) -> bool {
        self.saw_end_stream = true;
        self.saw_trailers = true;
        if self.buffer.is_empty() {
            self.trailers_released = true;
            return false;
        }
        true
    }

    /// Handle a fired refill timer. Stale or foreign events are ignored.
    pub fn on_token_timer(&mut self, event: TimerEvent) {
        let current = self.token_timer.as_ref().map(TimerHandle::id);
        if event.kind != TimerKind::TokenRefill || current != Some(event.id) {
            trace!(?event, "limiter: ignoring stale timer");
            return;
        }
        self.token_timer = None;
        self.bucket.refill();
        trace!(
            available = self.bucket.available(),
            buffered = self.buffer.len(),
            "limiter: timer wakeup"
        );
        self.drain();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_waiting_for_token(&self) -> bool {
        self.waiting_for_token
    }

    pub fn bytes_per_time_slice(&self) -> u64 {
        self.bytes_per_time_slice
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.bucket.capacity()
    }

    fn drain(&mut self) {
        while !self.buffer.is_empty() && self.bucket.available() > 0 {
            let wanted = (self.buffer.len() as u64).min(self.bytes_per_time_slice);
            let granted = self.bucket.consume_up_to(wanted);
            // granted <= buffer length, so this never panics
            let chunk = self.buffer.split_to(granted as usize).freeze();
            self.write_chunk(chunk);
        }

        if !self.buffer.is_empty() && self.token_timer.is_none() {
            match self.timers.schedule(TIME_SLICE, TimerKind::TokenRefill) {
                Ok(handle) => self.token_timer = Some(handle),
                Err(e) => {
                    warn!("limiter: cannot schedule refill, releasing buffered data: {}", e);
                    let rest = self.buffer.split().freeze();
                    self.write_chunk(rest);
                }
            }
        }

        if self.buffer.is_empty() {
            self.waiting_for_token = false;
            self.token_timer = None;
            if self.saw_end_stream && !self.saw_trailers && !self.end_stream_written {
                self.end_stream_written = true;
                self.callbacks.write_data(Bytes::new(), true);
            }
            if self.saw_trailers && !self.trailers_released {
                self.trailers_released = true;
                self.callbacks.continue_trailers();
            }
        } else {
            self.waiting_for_token = true;
        }

        if self.above_high_watermark && self.buffer.len() <= self.low_watermark {
            self.above_high_watermark = false;
            debug!(buffered = self.buffer.len(), "limiter: resuming upstream");
            self.callbacks.resume_data();
        }
    }

    fn write_chunk(&mut self, chunk: Bytes) {
        let end_stream = self.saw_end_stream && self.buffer.is_empty() && !self.saw_trailers;
        if end_stream {
            self.end_stream_written = true;
        }
        trace!(len = chunk.len(), end_stream, "limiter: writing");
        self.callbacks.write_data(chunk, end_stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::recording::{RecordingCallbacks, StreamEvent};
    use crate::timer::manual::ManualTimers;

    fn limiter(
        kbps: u64,
        max_buffered: u64,
    ) -> (
        StreamRateLimiter<RecordingCallbacks>,
        RecordingCallbacks,
        ManualTimers,
    ) {
        let callbacks = RecordingCallbacks::new();
        let timers = ManualTimers::new();
        let limiter = StreamRateLimiter::new(
            kbps,
            max_buffered,
            callbacks.clone(),
            Arc::new(timers.clone()),
        )
        .unwrap();
        (limiter, callbacks, timers)
    }

    fn run(
        limiter: &mut StreamRateLimiter<RecordingCallbacks>,
        timers: &ManualTimers,
        by: Duration,
    ) {
        timers.advance(by, |event| limiter.on_token_timer(event));
    }

    #[test]
    fn test_rejects_zero_rate_or_buffer() {
        let timers: Arc<dyn TimerService> = Arc::new(ManualTimers::new());
        assert!(StreamRateLimiter::new(0, 10, RecordingCallbacks::new(), timers.clone()).is_err());
        assert!(StreamRateLimiter::new(8, 0, RecordingCallbacks::new(), timers).is_err());
    }

    #[test]
    fn test_small_write_goes_out_immediately() {
        let (mut limiter, callbacks, timers) = limiter(8, 2000);
        assert_eq!(limiter.bytes_per_time_slice(), 62);

        limiter.write_data(Bytes::from(vec![0u8; 40]), true);
        assert_eq!(
            callbacks.events(),
            vec![StreamEvent::Write {
                len: 40,
                end_stream: true
            }]
        );
        assert!(!limiter.is_waiting_for_token());
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_scenario_pause_pace_resume() {
        // 8 kbps = 1000 bytes/sec, buffer limit 2000.
        let (mut limiter, callbacks, timers) = limiter(8, 2000);

        limiter.write_data(Bytes::from(vec![7u8; 5000]), true);
        assert_eq!(callbacks.count(&StreamEvent::Pause), 1);
        assert_eq!(callbacks.written(), 62);
        assert!(limiter.is_waiting_for_token());

        run(&mut limiter, &timers, Duration::from_secs(1));
        let after_one_second = callbacks.written();
        assert!(after_one_second <= 62 + 1000, "wrote {}", after_one_second);
        assert!(after_one_second >= 900);
        assert_eq!(callbacks.count(&StreamEvent::Resume), 0);

        for second in 2..=6u64 {
            run(&mut limiter, &timers, Duration::from_secs(1));
            assert!(callbacks.written() as u64 <= 62 + 1000 * second);
        }

        assert_eq!(callbacks.written(), 5000);
        assert_eq!(callbacks.count(&StreamEvent::Resume), 1);
        assert_eq!(limiter.buffered(), 0);
        assert!(!limiter.is_waiting_for_token());
        assert_eq!(timers.pending(), 0);

        let events = callbacks.events();
        let resume_at = events.iter().position(|e| *e == StreamEvent::Resume).unwrap();
        let written_before_resume: usize = events[..resume_at]
            .iter()
            .map(|e| match e {
                StreamEvent::Write { len, .. } => *len,
                _ => 0,
            })
            .sum();
        assert!(5000 - written_before_resume < 2000);

        let end_streams = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Write { end_stream: true, .. }))
            .count();
        assert_eq!(end_streams, 1);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Write { end_stream: true, .. })
        ));
    }

    #[test]
    fn test_data_while_waiting_is_only_buffered() {
        let (mut limiter, callbacks, timers) = limiter(8, 10_000);
        limiter.write_data(Bytes::from(vec![0u8; 100]), false);
        assert_eq!(callbacks.written(), 62);

        limiter.write_data(Bytes::from(vec![0u8; 100]), false);
        assert_eq!(callbacks.written(), 62);
        assert_eq!(limiter.buffered(), 138);
        assert_eq!(timers.pending(), 1);

        run(&mut limiter, &timers, TIME_SLICE);
        assert_eq!(callbacks.written(), 124);
    }

    #[test]
    fn test_end_stream_without_data() {
        let (mut paced, callbacks, timers) = limiter(8, 2000);
        paced.write_data(Bytes::from(vec![0u8; 100]), false);
        paced.write_data(Bytes::new(), true);

        run(&mut paced, &timers, TIME_SLICE);
        assert_eq!(
            callbacks.events().last(),
            Some(&StreamEvent::Write {
                len: 38,
                end_stream: true
            })
        );

        let (mut idle, idle_callbacks, _) = limiter(8, 2000);
        idle.write_data(Bytes::new(), true);
        assert_eq!(
            idle_callbacks.events(),
            vec![StreamEvent::Write {
                len: 0,
                end_stream: true
            }]
        );
    }

    #[test]
    fn test_trailers_held_until_drained() {
        let (mut limiter, callbacks, timers) = limiter(8, 2000);
        limiter.write_data(Bytes::from(vec![0u8; 100]), false);
        assert!(limiter.on_trailers());

        run(&mut limiter, &timers, TIME_SLICE);
        let events = callbacks.events();
        assert_eq!(events.last(), Some(&StreamEvent::ContinueTrailers));
        // Trailers carry the end of stream, not the data.
        assert!(events
            .iter()
            .all(|e| !matches!(e, StreamEvent::Write { end_stream: true, .. })));
    }

    #[test]
    fn test_trailers_pass_when_buffer_empty() {
        let (mut limiter, callbacks, _) = limiter(8, 2000);
        limiter.write_data(Bytes::from(vec![0u8; 10]), false);
        assert!(!limiter.on_trailers());
        assert_eq!(callbacks.count(&StreamEvent::ContinueTrailers), 0);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let (mut limiter, callbacks, timers) = limiter(8, 2000);
        limiter.write_data(Bytes::from(vec![0u8; 100]), false);

        let stale = TimerEvent {
            id: crate::timer::TimerId::from_raw(999),
            kind: TimerKind::TokenRefill,
        };
        limiter.on_token_timer(stale);
        assert_eq!(callbacks.written(), 62);
        assert_eq!(timers.pending(), 1);
    }

    #[test]
    fn test_drop_cancels_refill_timer() {
        let (mut limiter, _, timers) = limiter(8, 2000);
        limiter.write_data(Bytes::from(vec![0u8; 500]), false);
        assert_eq!(timers.pending(), 1);
        drop(limiter);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_schedule_failure_flushes() {
        let (mut limiter, callbacks, timers) = limiter(8, 2000);
        timers.set_failing(true);
        limiter.write_data(Bytes::from(vec![0u8; 500]), true);
        assert_eq!(callbacks.written(), 500);
        assert_eq!(limiter.buffered(), 0);
        assert!(!limiter.is_waiting_for_token());
    }

    #[test]
    fn test_one_byte_limit_still_resumes() {
        let (mut limiter, callbacks, timers) = limiter(8, 1);
        limiter.write_data(Bytes::from(vec![0u8; 500]), true);
        assert_eq!(callbacks.count(&StreamEvent::Pause), 1);

        run(&mut limiter, &timers, Duration::from_secs(5));
        assert_eq!(limiter.buffered(), 0);
        assert_eq!(callbacks.written(), 500);
        assert_eq!(callbacks.count(&StreamEvent::Resume), 1);
    }
}
