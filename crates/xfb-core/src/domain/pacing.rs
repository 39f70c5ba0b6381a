//! Screen request pacing.
//!
//! # How frames are paced (for beginners)
//!
//! The client pulls frames: it sends a screen request, the server answers with
//! either a new frame ("updated") or "nothing changed". There is at most one
//! request in flight at a time.
//!
//! - **Updated** – the screen is changing, so the client asks again right away.
//! - **Not updated** – asking again immediately would spin, so the next request
//!   is delayed by `1000 / target_fps` milliseconds.
//! - **Raising the target fps** – the user wants a snappier display *now*, so
//!   one eager request is issued at once instead of waiting for the timer.
//!
//! # Why a generation counter?
//!
//! A delayed request may become obsolete before it fires: an eager request
//! replaced it, or its reply arrived late. Instead of tracking and cancelling
//! callbacks, every issued request bumps a generation counter, and both the
//! single pending timer and every reply carry the generation they belong to.
//! Anything whose generation is not the current one is stale and ignored.
//!
//! The scheduler takes `now` as a parameter instead of reading the clock, so it
//! can be driven deterministically in tests.

use std::time::{Duration, Instant};

/// Identifies one issued screen request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn generation(self) -> u64 {
        self.0
    }
}

/// The one delayed request that may be pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timer {
    due: Instant,
    generation: u64,
}

/// Decides when the next screen request is sent.
#[derive(Debug)]
pub struct RefreshScheduler {
    generation: u64,
    timer: Option<Timer>,
    target_fps: u32,
}

impl RefreshScheduler {
    /// Creates a scheduler. `target_fps` is clamped to at least 1.
    pub fn new(target_fps: u32) -> Self {
        Self {
            generation: 0,
            timer: None,
            target_fps: target_fps.max(1),
        }
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    /// Delay between "not updated" and the next request.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.target_fps))
    }

    /// Issues a request right now, invalidating any pending timer and any
    /// reply still expected for an older request.
    pub fn request_now(&mut self) -> RequestToken {
        self.generation += 1;
        self.timer = None;
        RequestToken(self.generation)
    }

    /// Handles the reply to `token`.
    ///
    /// Returns the token of a request to send immediately (frame was updated),
    /// or `None` after arming the delay timer (frame was not updated). Replies
    /// to stale tokens are ignored.
    pub fn on_reply(&mut self, token: RequestToken, updated: bool, now: Instant) -> Option<RequestToken> {
        if token.0 != self.generation {
            return None;
        }
        if updated {
            return Some(self.request_now());
        }
        self.timer = Some(Timer {
            due: now + self.interval(),
            generation: self.generation,
        });
        None
    }

    /// Changes the target rate. Raising it issues one eager request.
    pub fn set_target_fps(&mut self, fps: u32) -> Option<RequestToken> {
        let fps = fps.max(1);
        let raised = fps > self.target_fps;
        self.target_fps = fps;
        raised.then(|| self.request_now())
    }

    /// When the pending timer is due, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.due)
    }

    /// Fires the pending timer if it is due and still current.
    pub fn poll_timer(&mut self, now: Instant) -> Option<RequestToken> {
        let timer = self.timer?;
        if timer.due > now {
            return None;
        }
        self.timer = None;
        (timer.generation == self.generation).then(|| self.request_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_updated_schedules_one_request_after_interval() {
        // Arrange
        let start = Instant::now();
        let mut scheduler = RefreshScheduler::new(20);
        let token = scheduler.request_now();

        // Act
        let immediate = scheduler.on_reply(token, false, start);

        // Assert
        assert_eq!(immediate, None);
        assert_eq!(scheduler.next_deadline(), Some(start + Duration::from_millis(50)));
        assert_eq!(scheduler.poll_timer(start + Duration::from_millis(49)), None);
        assert!(scheduler.poll_timer(start + Duration::from_millis(50)).is_some());
        // Exactly one: the timer is consumed.
        assert_eq!(scheduler.poll_timer(start + Duration::from_millis(500)), None);
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_updated_requests_again_immediately() {
        let mut scheduler = RefreshScheduler::new(30);
        let token = scheduler.request_now();

        let next = scheduler.on_reply(token, true, Instant::now());

        assert!(next.is_some());
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_raising_fps_issues_eager_request_and_cancels_timer() {
        // Arrange
        let start = Instant::now();
        let mut scheduler = RefreshScheduler::new(1);
        let token = scheduler.request_now();
        scheduler.on_reply(token, false, start);

        // Act
        let eager = scheduler.set_target_fps(10);

        // Assert
        assert!(eager.is_some());
        assert_eq!(scheduler.next_deadline(), None);
        assert_eq!(scheduler.poll_timer(start + Duration::from_secs(5)), None);
    }

    #[test]
    fn test_lowering_fps_does_not_issue_request() {
        let mut scheduler = RefreshScheduler::new(30);
        assert_eq!(scheduler.set_target_fps(5), None);
        assert_eq!(scheduler.interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_stale_reply_is_ignored() {
        // Arrange: a reply to the first request arrives after an eager one.
        let mut scheduler = RefreshScheduler::new(10);
        let old = scheduler.request_now();
        let _eager = scheduler.set_target_fps(20);

        // Act
        let result = scheduler.on_reply(old, true, Instant::now());

        // Assert
        assert_eq!(result, None);
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_zero_fps_is_clamped() {
        let scheduler = RefreshScheduler::new(0);
        assert_eq!(scheduler.target_fps(), 1);
        assert_eq!(scheduler.interval(), Duration::from_millis(1000));
    }
}
