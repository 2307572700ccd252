//! Checks over recorded frame metadata.
//!
//! Useful for soak and integration testing: record a run with
//! [`FrameView::record`](crate::FrameView::record), then check that the driver
//! delivered every frame and that its timestamps can be trusted for latency
//! analysis.

use std::collections::HashMap;

use crate::camera::FrameRecord;
use crate::error::{CaptureError, Result};

/// Validates that driver sequence numbers increment by exactly one.
///
/// # Errors
///
/// Returns `Validation` if:
/// - The frames slice is empty
/// - Any sequence number doesn't increment by exactly 1 from the previous
pub fn validate_frame_sequence(frames: &[FrameRecord]) -> Result<()> {
    if frames.is_empty() {
        return Err(CaptureError::Validation(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        let expected = prev.sequence.wrapping_add(1);
        if curr.sequence != expected {
            return Err(CaptureError::Validation(format!(
                "Frame sequence gap at index {}: expected {expected}, got {}",
                i + 1,
                curr.sequence
            )));
        }
    }

    Ok(())
}

/// Validates that driver timestamps strictly increase.
///
/// Checked across the whole run and separately for every reused buffer
/// index. Equal timestamps are flagged too: they cannot be told apart from
/// a driver that stamps at the wrong point.
///
/// # Errors
///
/// Returns `Validation` on an empty slice or the first equal or decreasing
/// timestamp.
pub fn validate_timestamps_monotonic(frames: &[FrameRecord]) -> Result<()> {
    if frames.is_empty() {
        return Err(CaptureError::Validation(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    let mut last_by_index: HashMap<u32, u64> = HashMap::new();
    let mut previous: Option<u64> = None;

    for (i, frame) in frames.iter().enumerate() {
        let ts = frame.driver_timestamp_us;

        if let Some(last) = last_by_index.insert(frame.index, ts) {
            if ts <= last {
                return Err(CaptureError::Validation(format!(
                    "Buffer {} timestamp did not advance at frame {i}: {last}us then {ts}us",
                    frame.index
                )));
            }
        }
        if let Some(prev) = previous {
            if ts <= prev {
                return Err(CaptureError::Validation(format!(
                    "Timestamp did not advance at frame {i}: {prev}us then {ts}us"
                )));
            }
        }
        previous = Some(ts);
    }

    Ok(())
}

/// Frame interval and clock offset statistics for a recorded run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    /// Number of frames measured.
    pub frames: usize,
    /// Shortest driver-timestamp interval.
    pub interval_min_us: u64,
    /// Longest driver-timestamp interval.
    pub interval_max_us: u64,
    /// Mean driver-timestamp interval.
    pub interval_avg_us: f64,
    /// Mean host-monotonic minus driver timestamp.
    pub mean_host_offset_us: f64,
}

impl TimingStats {
    /// Compute statistics; needs at least two frames.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_records(frames: &[FrameRecord]) -> Option<Self> {
        if frames.len() < 2 {
            return None;
        }

        let intervals: Vec<u64> = frames
            .windows(2)
            .filter_map(|pair| match pair {
                [prev, curr] => Some(
                    curr.driver_timestamp_us
                        .saturating_sub(prev.driver_timestamp_us),
                ),
                _ => None,
            })
            .collect();
        let interval_min_us = intervals.iter().copied().min()?;
        let interval_max_us = intervals.iter().copied().max()?;
        let interval_avg_us = intervals.iter().sum::<u64>() as f64 / intervals.len() as f64;

        let offset_sum: i128 = frames
            .iter()
            .map(|frame| i128::from(frame.host_offset_us()))
            .sum();
        let mean_host_offset_us = offset_sum as f64 / frames.len() as f64;

        Some(Self {
            frames: frames.len(),
            interval_min_us,
            interval_max_us,
            interval_avg_us,
            mean_host_offset_us,
        })
    }

    /// Spread between the longest and shortest interval.
    pub const fn jitter_us(&self) -> u64 {
        self.interval_max_us - self.interval_min_us
    }
}
