//! Computes a shared future start instant from per-device RTC snapshots.
//! The device clocks drift independently and are only coarsely
//! synchronized, so the start is scheduled a few seconds ahead and the
//! whole capture is refused when the clocks disagree by more than the
//! configured tolerance.

use crate::registry::{ClockSnapshot, DeviceRegistry};
use std::fmt::{self, Display};
use std::time::Instant;

/// Seconds added to the estimated device clocks when scheduling a start.
/// Must exceed the worst one-way network latency or a device will receive
/// its configuration after the chosen instant has already passed. Also the
/// default skew tolerance.
pub const DEFAULT_FORWARD_OFFSET_SECS: u32 = 4;

/// Why no start instant could be computed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockError {
    /// No connected device has reported its clock yet.
    NoDevices,
    /// The device clocks disagree by more than the allowed tolerance.
    ClockSkewTooLarge {
        /// Observed spread between the fastest and slowest clock, seconds.
        spread: f64,
        /// Largest spread the session will accept, seconds.
        limit: f64,
    },
}

impl Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClockError::NoDevices => write!(f, "no connected device has reported its clock"),
            ClockError::ClockSkewTooLarge { spread, limit } => write!(
                f,
                "device clocks are {spread:.1}s apart, more than the {limit:.1}s tolerance; re-synch the RTCs"
            ),
        }
    }
}

impl std::error::Error for ClockError {}

/// Estimates what a device clock reads right now, plus the forward offset:
/// the value it reported, aged by how long ago the report arrived.
pub fn estimate_rtc(snapshot: &ClockSnapshot, now: Instant, forward_offset_secs: u32) -> f64 {
    snapshot.rtc_secs as f64
        + now.saturating_duration_since(snapshot.read_at).as_secs_f64()
        + forward_offset_secs as f64
}

/// Picks one start instant that is still in the future on every connected
/// device. Each device contributes an estimate of its current clock; if
/// the spread between estimates exceeds `skew_limit_secs` the start is
/// refused. On success the largest estimate wins, so no device is asked
/// to start at a time its own clock has already passed.
///
/// Connected devices that have not reported their clock contribute no
/// estimate; if none has, the result is [`ClockError::NoDevices`].
pub fn compute_start_instant(
    registry: &DeviceRegistry,
    now: Instant,
    forward_offset_secs: u32,
    skew_limit_secs: f64,
) -> Result<u32, ClockError> {
    let estimates: Vec<f64> = registry
        .connected_devices()
        .iter()
        .filter_map(|name| registry.clock_snapshot(name))
        .map(|snapshot| estimate_rtc(&snapshot, now, forward_offset_secs))
        .collect();

    if estimates.is_empty() {
        return Err(ClockError::NoDevices);
    }

    let earliest = estimates.iter().cloned().fold(f64::INFINITY, f64::min);
    let latest = estimates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let spread = latest - earliest;
    if spread > skew_limit_secs {
        return Err(ClockError::ClockSkewTooLarge {
            spread,
            limit: skew_limit_secs,
        });
    }

    Ok(latest as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use std::time::Duration;

    fn registry_with(devices: &[(&str, u32)], read_at: Instant) -> DeviceRegistry {
        let names: Vec<String> = devices.iter().map(|(n, _)| n.to_string()).collect();
        let mut registry = DeviceRegistry::new(&names);
        for (name, rtc) in devices {
            registry.set_connected(name).unwrap();
            registry.record_clock_snapshot(name, *rtc, read_at).unwrap();
        }
        registry
    }

    #[test]
    fn no_connected_devices_is_an_error() {
        let registry = DeviceRegistry::new(&["sensor1".to_owned()]);
        assert_eq!(
            compute_start_instant(&registry, Instant::now(), 4, 4.0),
            Err(ClockError::NoDevices)
        );
    }

    #[test]
    fn connected_device_without_clock_report_is_an_error() {
        let mut registry = DeviceRegistry::new(&["sensor1".to_owned()]);
        registry.set_connected("sensor1").unwrap();
        assert_eq!(
            compute_start_instant(&registry, Instant::now(), 4, 4.0),
            Err(ClockError::NoDevices)
        );
    }

    #[test]
    fn skewed_clocks_are_rejected() {
        let read_at = Instant::now();
        let registry = registry_with(&[("sensor1", 0), ("sensor2", 100)], read_at);

        match compute_start_instant(&registry, read_at, 4, 4.0) {
            Err(ClockError::ClockSkewTooLarge { spread, limit }) => {
                assert!((spread - 100.0).abs() < 0.5);
                assert_eq!(limit, 4.0);
            }
            other => panic!("expected skew rejection, got {other:?}"),
        }
    }

    #[test]
    fn within_tolerance_returns_the_latest_estimate() {
        let read_at = Instant::now();
        let registry = registry_with(&[("sensor1", 100), ("sensor2", 102)], read_at);

        // Estimates are 104 and 106; the later one keeps the start in the
        // future on both devices.
        let start = compute_start_instant(&registry, read_at, 4, 4.0).unwrap();
        assert_eq!(start, 106);
    }

    #[test]
    fn single_device_skips_the_skew_comparison() {
        let read_at = Instant::now();
        let registry = registry_with(&[("sensor1", 0)], read_at);
        let now = read_at + Duration::from_secs(10);

        // rtc 0, read 10s ago, forward offset 3: estimate is 13.
        let start = compute_start_instant(&registry, now, 3, 3.0).unwrap();
        assert_eq!(start, 13);
    }

    #[test]
    fn estimates_age_with_wall_clock_time() {
        let read_at = Instant::now();
        let snapshot = ClockSnapshot {
            rtc_secs: 50,
            read_at,
        };
        let now = read_at + Duration::from_secs(7);
        let estimate = estimate_rtc(&snapshot, now, 4);
        assert!((estimate - 61.0).abs() < 1e-9);
    }
}
