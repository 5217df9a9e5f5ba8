// crates/tonecut-core/src/gate.rs
//
// Time-range gate: a pure filter between the demuxer and whatever consumes
// its AUs (decoder feed or lossless remux). The demuxer is seeked to the
// nearest preceding sync sample before the pipeline starts; the gate then
// discards the pre-roll, rebases kept timestamps so the output starts at
// zero, and closes the feed at the end of the range.

use crate::media_types::TimeRange;

/// Verdict for one AU timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Pre-roll before the range start: advance the demuxer, queue nothing.
    Skip,
    /// Inside the range; carries the rebased timestamp.
    Pass(i64),
    /// At or past the range end: emit EOS downstream, stop reading.
    End,
}

#[derive(Debug)]
pub struct TimeRangeGate {
    range: TimeRange,
    /// Timestamp of the first admitted AU; all kept timestamps rebase
    /// against it so the first emitted timestamp is exactly zero.
    base_us: Option<i64>,
    closed: bool,
}

impl TimeRangeGate {
    pub fn new(range: TimeRange) -> Self {
        Self { range, base_us: None, closed: false }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn admit(&mut self, pts_us: i64) -> GateDecision {
        if self.closed {
            return GateDecision::End;
        }
        if pts_us >= self.range.end_us {
            self.closed = true;
            return GateDecision::End;
        }
        if pts_us < self.range.start_us {
            return GateDecision::Skip;
        }
        let base = *self.base_us.get_or_insert(pts_us);
        GateDecision::Pass(pts_us - base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(start_us: i64, end_us: i64) -> TimeRangeGate {
        TimeRangeGate::new(TimeRange { start_us, end_us })
    }

    #[test]
    fn first_admitted_au_lands_at_zero() {
        let mut g = gate(1_234_000, 5_678_000);
        assert_eq!(g.admit(1_200_000), GateDecision::Skip);
        assert_eq!(g.admit(1_240_000), GateDecision::Pass(0));
        assert_eq!(g.admit(1_280_000), GateDecision::Pass(40_000));
    }

    #[test]
    fn closes_at_end_and_stays_closed() {
        let mut g = gate(0, 100_000);
        assert_eq!(g.admit(0), GateDecision::Pass(0));
        assert_eq!(g.admit(99_999), GateDecision::Pass(99_999));
        assert_eq!(g.admit(100_000), GateDecision::End);
        assert!(g.is_closed());
        // Once closed, everything is End — even earlier timestamps.
        assert_eq!(g.admit(0), GateDecision::End);
    }

    #[test]
    fn zero_start_passes_from_first_au() {
        let mut g = gate(0, 50_000);
        assert_eq!(g.admit(0), GateDecision::Pass(0));
        assert_eq!(g.admit(23_220), GateDecision::Pass(23_220));
    }

    #[test]
    fn rebased_timestamps_stay_within_span_plus_one_frame() {
        let frame_us = 23_220;
        let mut g = gate(1_000_000, 3_000_000);
        let mut last = 0;
        let mut pts = 980_000; // sync landing just before the range
        loop {
            match g.admit(pts) {
                GateDecision::Pass(rebased) => last = rebased,
                GateDecision::End => break,
                GateDecision::Skip => {}
            }
            pts += frame_us;
        }
        assert!(last <= 2_000_000 + frame_us);
    }
}
