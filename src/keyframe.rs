//! Keyframe lookup for seeking

use crate::error::{ClipError, Result};
use crate::types::SampleDescriptor;

/// Find the sample index decoding must restart from to reach `target`.
///
/// `target` is in the track's timescale units. The first sample whose
/// composition timestamp is at or after `target` is located; if it is not a
/// sync sample, the scan walks backwards to the closest preceding sync
/// sample (or index 0). Sync samples are at most one GOP apart, so the
/// linear walk stays short.
pub fn find_start_sample_index(samples: &[SampleDescriptor], target: i64) -> Result<usize> {
    let end_idx = samples
        .iter()
        .position(|s| s.cts >= target)
        .ok_or_else(|| {
            ClipError::NotFound(format!(
                "no sample at or after {} ({} samples buffered)",
                target,
                samples.len()
            ))
        })?;

    if samples[end_idx].is_sync {
        return Ok(end_idx);
    }

    let mut start_idx = end_idx.saturating_sub(1);
    while start_idx > 0 && !samples[start_idx].is_sync {
        start_idx -= 1;
    }
    Ok(start_idx)
}
