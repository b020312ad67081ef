use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::errors::TimerError;
use crate::roles::{Lane, LANE_COUNT};

/// Source of the server's authoritative epoch-millisecond time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a lane's elapsed value was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElapsedSource {
    /// Operator's stop instant normalised against the server start.
    Client,
    /// Server receive time, used when the operator sent no instant.
    Server,
    /// No race was running; the value is a placeholder zero.
    Unmeasured,
    /// Admin override of a single lane.
    Admin,
    /// Operator correction after a lost acknowledgment.
    Resend,
}

/// Result of a lane operator stopping their own lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Recorded { elapsed: u64, source: ElapsedSource },
    AlreadyFinalized(u64),
}

/// The race clock plus one finalisable slot per lane.
///
/// Authorization is the caller's job; every method here assumes the caller
/// already holds the right role.
pub struct TimerSession {
    clock: Arc<dyn Clock>,
    start_timestamp: Option<i64>,
    lanes: [Option<u64>; LANE_COUNT],
}

impl TimerSession {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            start_timestamp: None,
            lanes: [None; LANE_COUNT],
        }
    }

    pub fn start_timestamp(&self) -> Option<i64> {
        self.start_timestamp
    }

    pub fn is_active(&self) -> bool {
        self.start_timestamp.is_some()
    }

    pub fn lane_elapsed(&self, lane: Lane) -> Option<u64> {
        self.lanes[lane.index()]
    }

    pub fn lanes(&self) -> [Option<u64>; LANE_COUNT] {
        self.lanes
    }

    /// Begin a new race, abandoning any unfinished one.
    pub fn start(&mut self) -> i64 {
        let now = self.clock.now_ms();
        self.start_timestamp = Some(now);
        self.lanes = [None; LANE_COUNT];
        now
    }

    /// Record a lane operator's stop. A lane that already has a time keeps it.
    ///
    /// With no race running the result is a zero tagged `Unmeasured` and
    /// nothing is stored.
    pub fn stop_lane(&mut self, lane: Lane, client_stop_ms: Option<f64>) -> StopOutcome {
        if let Some(existing) = self.lanes[lane.index()] {
            return StopOutcome::AlreadyFinalized(existing);
        }

        let Some(start) = self.start_timestamp else {
            return StopOutcome::Recorded {
                elapsed: 0,
                source: ElapsedSource::Unmeasured,
            };
        };

        let (raw, source) = match client_stop_ms {
            Some(stop) => (stop - start as f64, ElapsedSource::Client),
            None => ((self.clock.now_ms() - start) as f64, ElapsedSource::Server),
        };
        let elapsed = clamp_elapsed(raw);
        self.lanes[lane.index()] = Some(elapsed);
        StopOutcome::Recorded { elapsed, source }
    }

    /// Stop a lane on the server's clock, replacing any recorded value.
    pub fn admin_override_lane(&mut self, lane: Lane) -> Result<u64, TimerError> {
        let start = self.start_timestamp.ok_or(TimerError::NoActiveRace)?;
        let elapsed = clamp_elapsed((self.clock.now_ms() - start) as f64);
        self.lanes[lane.index()] = Some(elapsed);
        Ok(elapsed)
    }

    /// Replace a recorded lane time with the operator's own copy.
    pub fn resend_lane_time(&mut self, lane: Lane, corrected_ms: f64) -> Result<u64, TimerError> {
        let slot = &mut self.lanes[lane.index()];
        if slot.is_none() {
            return Err(TimerError::LaneNotFinalized);
        }
        let elapsed = clamp_elapsed(corrected_ms);
        *slot = Some(elapsed);
        Ok(elapsed)
    }

    /// Fill every unfinished lane with the current server elapsed time.
    pub fn stop_all(&mut self) -> Result<[u64; LANE_COUNT], TimerError> {
        let start = self.start_timestamp.ok_or(TimerError::NoActiveRace)?;
        let now_elapsed = clamp_elapsed((self.clock.now_ms() - start) as f64);
        let mut snapshot = [0; LANE_COUNT];
        for (slot, out) in self.lanes.iter_mut().zip(snapshot.iter_mut()) {
            *out = *slot.get_or_insert(now_elapsed);
        }
        Ok(snapshot)
    }

    pub fn reset(&mut self) {
        self.start_timestamp = None;
        self.lanes = [None; LANE_COUNT];
    }
}

impl std::fmt::Debug for TimerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSession")
            .field("start_timestamp", &self.start_timestamp)
            .field("lanes", &self.lanes)
            .finish_non_exhaustive()
    }
}

/// Negative and non-finite durations become zero.
fn clamp_elapsed(raw_ms: f64) -> u64 {
    if !raw_ms.is_finite() || raw_ms < 0.0 {
        0
    } else {
        raw_ms.round() as u64
    }
}
