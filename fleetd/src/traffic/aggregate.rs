//! Reset-segmented traffic aggregation (spec §4.H). The remote counter
//! agent's cumulative `rx`/`tx` totals reset to zero whenever its process
//! restarts, so a plain `SUM` over raw rows over- or under-counts; instead
//! each maximal run between resets ("segment") contributes its own max, and
//! segments are summed.

use chrono::{DateTime, Utc};

use crate::db::models::{PmacctTrafficRecord, TrafficCountMode};

/// Usage in bytes for one instance across every segment found in `records`.
/// `records` must already be ordered by `timestamp` ascending (the
/// ingestion order guarantee, spec §5) — this function does not re-sort,
/// so callers that might hand it unordered rows must sort first.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentedUsage {
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

impl SegmentedUsage {
    pub fn total_bytes(&self, mode: TrafficCountMode) -> i64 {
        match mode {
            TrafficCountMode::Both => self.rx_bytes + self.tx_bytes,
            TrafficCountMode::In => self.rx_bytes,
            TrafficCountMode::Out => self.tx_bytes,
        }
    }

    pub fn total_mb(&self, mode: TrafficCountMode, multiplier: f64) -> f64 {
        (self.total_bytes(mode) as f64 * multiplier) / 1_048_576.0
    }
}

/// Assigns a segment id to each row (number of strictly-decreasing rx/tx
/// transitions seen so far), takes the per-segment max of rx and of tx, and
/// sums those maxes. This is the canonical aggregation described in spec
/// §4.H.
pub fn aggregate_segments(records: &[PmacctTrafficRecord]) -> SegmentedUsage {
    let mut usage = SegmentedUsage::default();
    let mut segment_max_rx = i64::MIN;
    let mut segment_max_tx = i64::MIN;
    let mut prev: Option<&PmacctTrafficRecord> = None;

    for record in records {
        let is_new_segment = match prev {
            Some(p) => record.rx_bytes < p.rx_bytes || record.tx_bytes < p.tx_bytes,
            None => true,
        };
        if is_new_segment {
            if segment_max_rx != i64::MIN {
                usage.rx_bytes += segment_max_rx;
                usage.tx_bytes += segment_max_tx;
            }
            segment_max_rx = record.rx_bytes;
            segment_max_tx = record.tx_bytes;
        } else {
            segment_max_rx = segment_max_rx.max(record.rx_bytes);
            segment_max_tx = segment_max_tx.max(record.tx_bytes);
        }
        prev = Some(record);
    }
    if segment_max_rx != i64::MIN {
        usage.rx_bytes += segment_max_rx;
        usage.tx_bytes += segment_max_tx;
    }
    usage
}

/// Builds the gap-filled, per-`step` incremental series used by the
/// historical views: each bucket's value is the segment-aggregated usage of
/// the rows falling in it minus the running total carried in from the
/// previous bucket, with empty buckets reported as zero (spec §4.H).
pub fn bucketed_increments(
    records: &[PmacctTrafficRecord],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    step: chrono::Duration,
) -> Vec<(DateTime<Utc>, SegmentedUsage)> {
    let mut buckets = Vec::new();
    let mut cursor = from;
    let mut running = SegmentedUsage::default();
    while cursor < to {
        let bucket_end = (cursor + step).min(to);
        let in_bucket: Vec<PmacctTrafficRecord> = records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < bucket_end)
            .cloned()
            .collect();
        let cumulative = aggregate_segments(&in_bucket);
        let increment = SegmentedUsage {
            rx_bytes: (cumulative.rx_bytes - running.rx_bytes).max(0),
            tx_bytes: (cumulative.tx_bytes - running.tx_bytes).max(0),
        };
        buckets.push((cursor, increment));
        running = cumulative;
        cursor = bucket_end;
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_utils::{InstanceId, ProviderId, UserId};

    fn record(ts: i64, rx: i64, tx: i64) -> PmacctTrafficRecord {
        PmacctTrafficRecord::new(
            InstanceId(1),
            ProviderId(1),
            UserId(1),
            DateTime::from_timestamp(ts, 0).unwrap(),
            rx,
            tx,
        )
    }

    #[test]
    fn single_segment_takes_final_max() {
        let records = vec![record(0, 100, 200), record(60, 150, 250), record(120, 300, 400)];
        let usage = aggregate_segments(&records);
        assert_eq!(usage.rx_bytes, 300);
        assert_eq!(usage.tx_bytes, 400);
    }

    #[test]
    fn counter_reset_starts_a_new_segment_and_sums_both_maxes() {
        // Agent restarts between the second and third samples: rx drops
        // from 300 to 10. The pre-reset segment contributes its max (300),
        // the post-reset segment contributes its own max (50).
        let records = vec![record(0, 100, 50), record(60, 300, 120), record(120, 10, 5), record(180, 50, 30)];
        let usage = aggregate_segments(&records);
        assert_eq!(usage.rx_bytes, 300 + 50);
        assert_eq!(usage.tx_bytes, 120 + 30);
    }

    #[test]
    fn total_mb_applies_mode_and_multiplier() {
        let usage = SegmentedUsage {
            rx_bytes: 1_048_576,
            tx_bytes: 2_097_152,
        };
        assert_eq!(usage.total_mb(TrafficCountMode::In, 1.0), 1.0);
        assert_eq!(usage.total_mb(TrafficCountMode::Out, 1.0), 2.0);
        assert_eq!(usage.total_mb(TrafficCountMode::Both, 2.0), 6.0);
    }
}
