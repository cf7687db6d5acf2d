//! Backpressure governor.
//!
//! Sampled on a fixed period while a session is open. Each direction is
//! judged on its *sink*: when the client's outbound buffer is congested the
//! upstream reader is paused, and vice versa. Pausing happens above
//! `pause` bytes and resuming only below `resume`, so a buffer hovering
//! around one threshold never flaps. Anything above `kill` aborts.

use crate::channel::Side;

/// Byte thresholds, applied to each sink independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    /// Pause the source reader above this.
    pub pause: usize,
    /// Resume a paused reader below this.
    pub resume: usize,
    /// Abort the session above this.
    pub kill: usize,
}

/// A change to one channel's read side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadAdjustment {
    /// Stop reading from this side.
    Pause(Side),
    /// Start reading from this side again.
    Resume(Side),
}

/// Outcome of one sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Apply these adjustments (possibly none) and carry on.
    Adjust(Vec<ReadAdjustment>),
    /// The named sink is past the kill threshold.
    Kill {
        /// The congested sink.
        sink: Side,
        /// What it had buffered.
        buffered: usize,
    },
}

/// Per-session hysteresis state.
#[derive(Debug)]
pub struct Governor {
    thresholds: Thresholds,
    client_reads_paused: bool,
    upstream_reads_paused: bool,
}

impl Governor {
    /// New governor with both readers running.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            client_reads_paused: false,
            upstream_reads_paused: false,
        }
    }

    /// Judge both sinks' buffered byte counts.
    pub fn sample(&mut self, client_buffered: usize, upstream_buffered: usize) -> Decision {
        for (sink, buffered) in [(Side::Client, client_buffered), (Side::Upstream, upstream_buffered)] {
            if buffered > self.thresholds.kill {
                return Decision::Kill { sink, buffered };
            }
        }

        let mut adjustments = Vec::new();
        adjustments.extend(self.judge(Side::Client, client_buffered));
        adjustments.extend(self.judge(Side::Upstream, upstream_buffered));
        Decision::Adjust(adjustments)
    }

    /// Whether the governor currently holds `side`'s reads paused.
    pub fn is_paused(&self, side: Side) -> bool {
        match side {
            Side::Client => self.client_reads_paused,
            Side::Upstream => self.upstream_reads_paused,
        }
    }

    /// Forget all pauses, returning the resumes needed to undo them.
    pub fn reset(&mut self) -> Vec<ReadAdjustment> {
        let mut resumes = Vec::new();
        for side in [Side::Client, Side::Upstream] {
            if std::mem::take(self.paused_mut(side)) {
                resumes.push(ReadAdjustment::Resume(side));
            }
        }
        resumes
    }

    fn judge(&mut self, sink: Side, buffered: usize) -> Option<ReadAdjustment> {
        let source = sink.opposite();
        let Thresholds { pause, resume, .. } = self.thresholds;
        let paused = self.paused_mut(source);
        if !*paused && buffered > pause {
            *paused = true;
            return Some(ReadAdjustment::Pause(source));
        }
        if *paused && buffered < resume {
            *paused = false;
            return Some(ReadAdjustment::Resume(source));
        }
        None
    }

    fn paused_mut(&mut self, side: Side) -> &mut bool {
        match side {
            Side::Client => &mut self.client_reads_paused,
            Side::Upstream => &mut self.upstream_reads_paused,
        }
    }
}
