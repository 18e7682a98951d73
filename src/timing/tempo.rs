use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlaybackError, Result};

/// 120 BPM, the MIDI default when a file carries no tempo event.
pub const DEFAULT_MICROS_PER_QUARTER: u32 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoChange {
    pub tick: u64,
    pub micros_per_quarter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    tick: u64,
    start_nanos: u128,
    micros_per_quarter: u32,
}

/// Piecewise-constant tempo over the tick axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempoMap {
    ticks_per_quarter: u16,
    segments: Vec<Segment>,
}

impl TempoMap {
    /// Builds a map from tempo changes sorted by tick. The region before the
    /// first change (or the whole song when there is none) runs at 120 BPM.
    pub fn new(ticks_per_quarter: u16, changes: Vec<TempoChange>) -> Result<Self> {
        if ticks_per_quarter == 0 {
            return Err(PlaybackError::InvalidTempoMap(
                "time division must be positive".into(),
            ));
        }

        let mut previous: Option<u64> = None;
        for change in &changes {
            if change.micros_per_quarter == 0 {
                return Err(PlaybackError::InvalidTempoMap(format!(
                    "tempo at tick {} must be positive",
                    change.tick
                )));
            }
            if let Some(prev) = previous {
                if change.tick <= prev {
                    return Err(PlaybackError::InvalidTempoMap(format!(
                        "tempo change at tick {} is not after tick {}",
                        change.tick, prev
                    )));
                }
            }
            previous = Some(change.tick);
        }

        let mut segments: Vec<Segment> = Vec::with_capacity(changes.len() + 1);
        if changes.first().is_none_or(|c| c.tick > 0) {
            segments.push(Segment {
                tick: 0,
                start_nanos: 0,
                micros_per_quarter: DEFAULT_MICROS_PER_QUARTER,
            });
        }

        for change in changes {
            let start_nanos = match segments.last() {
                Some(last) => {
                    last.start_nanos
                        + span_nanos(change.tick - last.tick, last.micros_per_quarter, ticks_per_quarter)
                }
                None => 0,
            };
            segments.push(Segment {
                tick: change.tick,
                start_nanos,
                micros_per_quarter: change.micros_per_quarter,
            });
        }

        Ok(Self {
            ticks_per_quarter,
            segments,
        })
    }

    pub fn with_tempo(ticks_per_quarter: u16, micros_per_quarter: u32) -> Result<Self> {
        Self::new(
            ticks_per_quarter,
            vec![TempoChange {
                tick: 0,
                micros_per_quarter,
            }],
        )
    }

    pub fn ticks_per_quarter(&self) -> u16 {
        self.ticks_per_quarter
    }

    pub fn changes(&self) -> impl Iterator<Item = TempoChange> + '_ {
        self.segments.iter().map(|s| TempoChange {
            tick: s.tick,
            micros_per_quarter: s.micros_per_quarter,
        })
    }

    pub fn ticks_to_wall_time(&self, ticks: u64) -> Duration {
        let idx = self.segments.partition_point(|s| s.tick <= ticks) - 1;
        let segment = &self.segments[idx];
        let nanos = segment.start_nanos
            + span_nanos(ticks - segment.tick, segment.micros_per_quarter, self.ticks_per_quarter);
        nanos_to_duration(nanos)
    }

    /// Inverse of [`ticks_to_wall_time`](Self::ticks_to_wall_time), rounding
    /// down to the tick in progress at `time`.
    pub fn wall_time_to_ticks(&self, time: Duration) -> u64 {
        let nanos = time.as_nanos();
        let idx = self.segments.partition_point(|s| s.start_nanos <= nanos) - 1;
        let segment = &self.segments[idx];
        let elapsed = nanos - segment.start_nanos;
        let per_quarter = segment.micros_per_quarter as u128 * 1_000;
        let ticks = elapsed * self.ticks_per_quarter as u128 / per_quarter;
        segment
            .tick
            .saturating_add(u64::try_from(ticks).unwrap_or(u64::MAX))
    }
}

fn span_nanos(ticks: u64, micros_per_quarter: u32, ticks_per_quarter: u16) -> u128 {
    ticks as u128 * micros_per_quarter as u128 * 1_000 / ticks_per_quarter as u128
}

fn nanos_to_duration(nanos: u128) -> Duration {
    let secs = (nanos / 1_000_000_000) as u64;
    let sub = (nanos % 1_000_000_000) as u32;
    Duration::new(secs, sub)
}

pub fn ticks_to_wall_time(ticks: u64, tempo_map: &TempoMap) -> Duration {
    tempo_map.ticks_to_wall_time(ticks)
}

pub fn wall_time_to_ticks(time: Duration, tempo_map: &TempoMap) -> u64 {
    tempo_map.wall_time_to_ticks(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_beat_at_120_bpm_is_half_a_second() {
        let map = TempoMap::with_tempo(480, 500_000).unwrap();
        assert_eq!(map.ticks_to_wall_time(480), Duration::from_millis(500));
        assert_eq!(map.wall_time_to_ticks(Duration::from_millis(500)), 480);
    }

    #[test]
    fn empty_map_uses_default_tempo() {
        let map = TempoMap::new(96, vec![]).unwrap();
        assert_eq!(map.ticks_to_wall_time(96 * 4), Duration::from_secs(2));
    }

    #[test]
    fn tempo_changes_apply_from_their_tick() {
        let map = TempoMap::new(
            480,
            vec![
                TempoChange {
                    tick: 0,
                    micros_per_quarter: 500_000,
                },
                TempoChange {
                    tick: 960,
                    micros_per_quarter: 1_000_000,
                },
            ],
        )
        .unwrap();

        assert_eq!(map.ticks_to_wall_time(960), Duration::from_secs(1));
        assert_eq!(map.ticks_to_wall_time(1440), Duration::from_secs(2));
        assert_eq!(map.wall_time_to_ticks(Duration::from_millis(1500)), 1200);
    }

    #[test]
    fn conversion_is_monotonic_and_round_trips_within_a_tick() {
        let map = TempoMap::new(
            96,
            vec![
                TempoChange {
                    tick: 100,
                    micros_per_quarter: 333_333,
                },
                TempoChange {
                    tick: 517,
                    micros_per_quarter: 712_001,
                },
            ],
        )
        .unwrap();

        let mut previous = Duration::ZERO;
        for tick in 0..2_000u64 {
            let wall = map.ticks_to_wall_time(tick);
            assert!(wall >= previous);
            previous = wall;

            let back = map.wall_time_to_ticks(wall);
            assert!(back <= tick && tick - back <= 1, "tick {tick} came back as {back}");
        }
    }

    #[test]
    fn rejects_unsorted_or_non_positive_maps() {
        assert!(matches!(
            TempoMap::new(0, vec![]),
            Err(PlaybackError::InvalidTempoMap(_))
        ));
        assert!(matches!(
            TempoMap::with_tempo(480, 0),
            Err(PlaybackError::InvalidTempoMap(_))
        ));
        let unsorted = vec![
            TempoChange {
                tick: 100,
                micros_per_quarter: 400_000,
            },
            TempoChange {
                tick: 50,
                micros_per_quarter: 400_000,
            },
        ];
        assert!(matches!(
            TempoMap::new(480, unsorted),
            Err(PlaybackError::InvalidTempoMap(_))
        ));
    }

    #[test]
    fn tick_lookup_saturates_near_the_end_of_the_axis() {
        let last = u64::MAX - 10;
        let map = TempoMap::new(
            480,
            vec![
                TempoChange {
                    tick: 0,
                    micros_per_quarter: 500_000,
                },
                TempoChange {
                    tick: last,
                    micros_per_quarter: 500_000,
                },
            ],
        )
        .unwrap();
        let at_last = map.ticks_to_wall_time(last);
        assert_eq!(map.wall_time_to_ticks(at_last), last);
        assert_eq!(map.wall_time_to_ticks(at_last + Duration::from_secs(1)), u64::MAX);
    }
}
