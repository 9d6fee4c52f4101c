//! Packet-rate estimation from CRR arrival times.
//!
//! The client only sees the packets that survived the network, so the
//! measurement window is extrapolated to where the first and last expected
//! packets would have been under the previous rate; without that, a lost
//! tail would bias the estimate high.

use crate::error::SanftError;
use std::collections::HashMap;
use std::time::Instant;

/// Derives a new packet rate from one ACR round's arrivals.
///
/// `arrivals` maps position-in-request-order to receive time for every CRR
/// that made it. Callers must guard against `prev_rate == 0`, fewer than two
/// expected packets, and an empty round.
pub fn compute_packet_rate(
    arrivals: &HashMap<usize, Instant>,
    n_expected: usize,
    prev_rate: u32,
) -> Result<u32, SanftError> {
    if prev_rate == 0 {
        return Err(SanftError::RateEstimation("previous rate is zero"));
    }
    if n_expected <= 1 {
        return Err(SanftError::RateEstimation("need at least two expected packets"));
    }
    let mut endpoints: Option<((usize, Instant), (usize, Instant))> = None;
    for (&idx, &t) in arrivals {
        endpoints = Some(match endpoints {
            None => ((idx, t), (idx, t)),
            Some((first, last)) => (
                if idx < first.0 { (idx, t) } else { first },
                if idx > last.0 { (idx, t) } else { last },
            ),
        });
    }
    let ((first_idx, first_t), (last_idx, last_t)) =
        endpoints.ok_or(SanftError::RateEstimation("no packets arrived"))?;

    let prev = f64::from(prev_rate);
    let n_received = arrivals.len() as f64;

    // Extrapolate both endpoints to the virtual positions 0 and
    // n_expected - 1. A reordered round can make the observed span
    // negative; saturating to zero then falls into the degenerate branch.
    let span = last_t.saturating_duration_since(first_t).as_secs_f64();
    let window = span
        + first_idx as f64 / prev
        + (n_expected - 1 - last_idx) as f64 / prev;

    if window <= 0.0 {
        // The arrivals do not separate in time; scale the old rate by the
        // delivery ratio instead of dividing by nothing.
        let scaled = prev * n_received / n_expected as f64;
        return Ok(scaled.max(1.0) as u32);
    }

    let measured = n_received / window;
    if measured.is_nan() {
        return Err(SanftError::RateEstimation("measured rate is NaN"));
    }
    Ok(measured.clamp(1.0, f64::from(u32::MAX)) as u32)
}
