//! Ramp stages and the sequencer that turns them into a continuous target curve.
//!
//! A list of [`Stage`]s is read as a sequence of control points
//! `(cumulative_duration, target)` starting at `(0, start)`. Between two points the
//! target is linearly interpolated:
//!
//! ```text
//! t = (elapsed - t_prev) / (t_next - t_prev)
//! v(elapsed) = v_prev + (v_next - v_prev) * t
//! ```
//!
//! Before the first point the curve returns `start`, after the last point it holds the
//! last target. A stage with a zero duration is a step: the curve jumps to its target
//! without passing through intermediate values.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_format;

/// A stage defines a target and how long to ramp to that target.
///
/// For VU executors the target is a worker count, for arrival-rate executors it is a
/// number of iterations per `time_unit`.
///
/// Use `Stage::new(Duration::from_secs(10), 100.0)` to ramp to 100 over 10s.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration_format")]
    pub duration: Duration,
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ControlPoint {
    at: f64,
    value: f64,
}

/// Pure, deterministic `elapsed -> target` function built from ramp stages.
#[derive(Clone, Debug, PartialEq)]
pub struct RampSequencer {
    start: f64,
    points: Vec<ControlPoint>,
    total: Duration,
}

impl RampSequencer {
    pub fn new(start: f64, stages: &[Stage]) -> Self {
        let mut total = Duration::ZERO;
        let points = stages
            .iter()
            .map(|stage| {
                total += stage.duration;
                ControlPoint {
                    at: total.as_secs_f64(),
                    value: stage.target,
                }
            })
            .collect();
        Self {
            start,
            points,
            total,
        }
    }

    /// A sequencer that holds `value` forever.
    pub fn constant(value: f64) -> Self {
        Self::new(value, &[])
    }

    pub fn start_value(&self) -> f64 {
        self.start
    }

    pub fn end_value(&self) -> f64 {
        self.points.last().map_or(self.start, |p| p.value)
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Target at `elapsed` since the timeline started.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return self.start;
        }
        let t = elapsed.as_secs_f64();
        let mut prev = ControlPoint {
            at: 0.0,
            value: self.start,
        };
        for &point in &self.points {
            if t < point.at {
                return lerp(prev, point, t);
            }
            prev = point;
        }
        prev.value
    }

    /// Area under the curve between `0` and `elapsed`, in `target * seconds`.
    ///
    /// Arrival-rate executors integrate their rate with this to know how many
    /// iterations are due, which keeps the long-run count exact regardless of how
    /// irregular the sampling ticks are.
    pub fn area_until(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        let mut area = 0.0;
        let mut prev = ControlPoint {
            at: 0.0,
            value: self.start,
        };
        for &point in &self.points {
            if point.at > prev.at {
                let end = point.at.min(t);
                if end > prev.at {
                    let end_value = lerp(prev, point, end);
                    area += (prev.value + end_value) / 2.0 * (end - prev.at);
                }
                if t <= point.at {
                    return area;
                }
            }
            prev = point;
        }
        area + prev.value * (t - prev.at).max(0.0)
    }

    /// Index of the stage that is active at `elapsed`, `None` once all stages are over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let t = elapsed.as_secs_f64();
        self.points.iter().position(|p| t < p.at)
    }

    /// Highest target the curve ever reaches.
    pub fn peak(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.value)
            .fold(self.start, f64::max)
    }
}

fn lerp(from: ControlPoint, to: ControlPoint, t: f64) -> f64 {
    let span = to.at - from.at;
    if span <= 0.0 {
        return to.value;
    }
    let factor = ((t - from.at) / span).clamp(0.0, 1.0);
    from.value + (to.value - from.value) * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn ramp_up_then_down() {
        let seq = RampSequencer::new(
            0.0,
            &[
                Stage::new(secs(10.0), 5.0),
                Stage::new(secs(10.0), 0.0),
            ],
        );

        assert_eq!(seq.value_at(Duration::ZERO), 0.0);
        assert_eq!(seq.value_at(secs(5.0)), 2.5);
        assert_eq!(seq.value_at(secs(10.0)), 5.0);
        assert_eq!(seq.value_at(secs(15.0)), 2.5);
        assert_eq!(seq.value_at(secs(20.0)), 0.0);
        assert_eq!(seq.value_at(secs(100.0)), 0.0);
        assert_eq!(seq.total_duration(), secs(20.0));
    }

    #[test]
    fn zero_duration_stage_is_a_step() {
        let seq = RampSequencer::new(
            1.0,
            &[
                Stage::new(secs(10.0), 1.0),
                Stage::new(Duration::ZERO, 50.0),
                Stage::new(secs(10.0), 50.0),
            ],
        );

        assert_eq!(seq.value_at(secs(9.999)), 1.0);
        assert_eq!(seq.value_at(secs(10.0)), 50.0);
        assert_eq!(seq.value_at(secs(15.0)), 50.0);
    }

    #[test]
    fn leading_step_still_starts_at_start_value() {
        let seq = RampSequencer::new(3.0, &[Stage::new(Duration::ZERO, 8.0)]);

        assert_eq!(seq.value_at(Duration::ZERO), 3.0);
        assert_eq!(seq.value_at(Duration::from_nanos(1)), 8.0);
    }

    #[test]
    fn no_stages_is_constant() {
        let seq = RampSequencer::constant(7.0);

        for s in [0.0, 1.0, 1e6] {
            assert_eq!(seq.value_at(secs(s)), 7.0);
        }
        assert_eq!(seq.total_duration(), Duration::ZERO);
        assert_eq!(seq.end_value(), 7.0);
    }

    #[test]
    fn area_of_constant_rate() {
        let seq = RampSequencer::new(10.0, &[Stage::new(secs(10.0), 10.0)]);

        assert_eq!(seq.area_until(secs(0.0)), 0.0);
        assert_eq!(seq.area_until(secs(1.0)), 10.0);
        assert_eq!(seq.area_until(secs(10.0)), 100.0);
        // holds the last target past the end
        assert_eq!(seq.area_until(secs(12.0)), 120.0);
    }

    #[test]
    fn area_of_ramp_is_a_triangle() {
        let seq = RampSequencer::new(0.0, &[Stage::new(secs(10.0), 100.0)]);

        assert_eq!(seq.area_until(secs(10.0)), 500.0);
        assert_eq!(seq.area_until(secs(5.0)), 125.0);
    }

    #[test]
    fn area_ignores_steps() {
        let seq = RampSequencer::new(
            0.0,
            &[
                Stage::new(Duration::ZERO, 20.0),
                Stage::new(secs(2.0), 20.0),
            ],
        );

        assert_eq!(seq.area_until(secs(2.0)), 40.0);
    }

    #[test]
    fn stage_tracking() {
        let seq = RampSequencer::new(
            0.0,
            &[Stage::new(secs(1.0), 1.0), Stage::new(secs(1.0), 2.0)],
        );

        assert_eq!(seq.stage_at(secs(0.5)), Some(0));
        assert_eq!(seq.stage_at(secs(1.5)), Some(1));
        assert_eq!(seq.stage_at(secs(2.0)), None);
        assert_eq!(seq.peak(), 2.0);
    }

    fn stages() -> impl Strategy<Value = (f64, Vec<Stage>)> {
        (
            0.0..1000.0f64,
            prop::collection::vec(
                (0u64..60_000, 0.0..1000.0f64)
                    .prop_map(|(ms, target)| Stage::new(Duration::from_millis(ms), target)),
                1..8,
            ),
        )
    }

    proptest! {
        #[test]
        fn starts_at_start_and_converges_to_last((start, stages) in stages()) {
            let seq = RampSequencer::new(start, &stages);
            let last = stages.last().map(|s| s.target).unwrap_or(start);

            prop_assert_eq!(seq.value_at(Duration::ZERO), start);
            prop_assume!(!seq.total_duration().is_zero());
            prop_assert_eq!(seq.value_at(seq.total_duration()), last);
            prop_assert_eq!(seq.value_at(seq.total_duration() + Duration::from_secs(3600)), last);
        }

        #[test]
        fn never_overshoots((start, stages) in stages(), at_ms in 0u64..500_000) {
            let seq = RampSequencer::new(start, &stages);
            let lo = stages.iter().map(|s| s.target).fold(start, f64::min);
            let hi = seq.peak();
            let v = seq.value_at(Duration::from_millis(at_ms));

            prop_assert!(v >= lo - 1e-9 && v <= hi + 1e-9, "{v} outside [{lo}, {hi}]");
        }
    }
}
