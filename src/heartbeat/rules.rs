//! The downtime state machine, free of I/O.

use chrono::{DateTime, Utc};

use crate::config::Limits;
use crate::db::{Device, NewEvent};

/// Result of applying one heartbeat to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Too close to the previous heartbeat. The device was not touched.
    TooSoon { retry_after: i64 },
    /// The device was updated in place.
    Accepted {
        /// Event to store along with the device, if anything noteworthy happened.
        event: Option<NewEvent>,
        /// Whole seconds since the previous heartbeat; `None` on the first one.
        gap: Option<i64>,
        /// The gap was long enough to count as an outage.
        came_back: bool,
    },
}

/// Apply a heartbeat received from `source_ip` at `now`.
///
/// Elapsed time is truncated to whole seconds before any comparison. The
/// rate limit deliberately uses `min_interval / blackout_coefficient`, which
/// is tighter than the reporting interval.
pub fn apply(device: &mut Device, source_ip: &str, now: DateTime<Utc>, limits: &Limits) -> Decision {
    let interval = limits.clamp_interval(device.interval);
    let mut event = NewEvent::new(now);
    let mut gap = None;
    let mut came_back = false;

    let previous_ip = match device.last_seen {
        None => {
            device.created = Some(now);
            None
        }
        Some(last_seen) => {
            let elapsed = (now - last_seen).num_seconds();
            if (elapsed as f64) < limits.min_interval as f64 / limits.blackout_coefficient {
                return Decision::TooSoon {
                    retry_after: interval - elapsed,
                };
            }

            event.started = Some(last_seen);
            if elapsed as f64 > interval as f64 * limits.blackout_coefficient {
                event.downtime = Some(elapsed);
                device.downtime += elapsed;
                device.downtime_uncrossed += elapsed;
                came_back = true;
            }
            gap = Some(elapsed);
            device.last_ip.clone()
        }
    };

    device.interval = interval;

    if previous_ip.as_deref() != Some(source_ip) {
        event.old_ip = previous_ip;
        event.new_ip = Some(source_ip.to_string());
    }

    let event = if event.is_worth_storing() {
        device.version += 1;
        Some(event)
    } else {
        None
    };

    device.last_ip = Some(source_ip.to_string());
    device.last_seen = Some(now);
    device.notified_down = false;

    Decision::Accepted {
        event,
        gap,
        came_back,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const IP: &str = "192.0.2.10";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, 6, 0, 0).unwrap()
    }

    /// A device that already reported once at `t0()` from `IP`.
    fn seen_device() -> Device {
        let mut device = Device::new(60, 150);
        device.id = 1;
        device.last_seen = Some(t0());
        device.last_ip = Some(IP.to_string());
        device
    }

    #[test]
    fn test_first_heartbeat_creates_address_event() {
        let mut device = Device::new(60, 150);
        let decision = apply(&mut device, IP, t0(), &Limits::default());

        let Decision::Accepted { event, gap, came_back } = decision else {
            panic!("first heartbeat must be accepted");
        };
        let event = event.unwrap();
        assert_eq!(event.started, None);
        assert_eq!(event.ended, t0());
        assert_eq!(event.downtime, None);
        assert_eq!(event.old_ip, None);
        assert_eq!(event.new_ip.as_deref(), Some(IP));
        assert_eq!(gap, None);
        assert!(!came_back);
        assert_eq!(device.created, Some(t0()));
        assert_eq!(device.last_seen, Some(t0()));
        assert_eq!(device.version, 1);
    }

    #[test]
    fn test_too_soon_leaves_device_untouched() {
        let mut device = seen_device();
        device.notified_down = true;
        let before = device.clone();

        let decision = apply(&mut device, "198.51.100.1", t0() + Duration::seconds(10), &Limits::default());

        assert_eq!(decision, Decision::TooSoon { retry_after: 50 });
        assert_eq!(device, before);
    }

    #[test]
    fn test_rate_limit_threshold_is_truncated_seconds() {
        let limits = Limits::default();
        // 24.9s truncates to 24s, which is not below 60 / 2.5 = 24.
        let mut device = seen_device();
        let at = t0() + Duration::milliseconds(24_900);
        assert!(matches!(apply(&mut device, IP, at, &limits), Decision::Accepted { gap: Some(24), .. }));

        let mut device = seen_device();
        let at = t0() + Duration::milliseconds(23_999);
        assert_eq!(apply(&mut device, IP, at, &limits), Decision::TooSoon { retry_after: 37 });
    }

    #[test]
    fn test_on_time_heartbeat_stores_nothing() {
        let mut device = seen_device();
        device.notified_down = true;

        let decision = apply(&mut device, IP, t0() + Duration::seconds(61), &Limits::default());

        assert_eq!(
            decision,
            Decision::Accepted { event: None, gap: Some(61), came_back: false }
        );
        assert_eq!(device.version, 0);
        assert_eq!(device.downtime, 0);
        assert!(!device.notified_down);
        assert_eq!(device.last_seen, Some(t0() + Duration::seconds(61)));
    }

    #[test]
    fn test_gap_records_downtime() {
        let mut device = seen_device();
        let now = t0() + Duration::seconds(200);

        let decision = apply(&mut device, IP, now, &Limits::default());

        let Decision::Accepted { event: Some(event), gap, came_back } = decision else {
            panic!("expected a downtime event");
        };
        assert_eq!(event.started, Some(t0()));
        assert_eq!(event.ended, now);
        assert_eq!(event.downtime, Some(200));
        assert_eq!(event.new_ip, None);
        assert_eq!(gap, Some(200));
        assert!(came_back);
        assert_eq!(device.downtime, 200);
        assert_eq!(device.downtime_uncrossed, 200);
        assert_eq!(device.version, 1);
    }

    #[test]
    fn test_gap_at_threshold_is_not_downtime() {
        let mut device = seen_device();
        let decision = apply(&mut device, IP, t0() + Duration::seconds(150), &Limits::default());
        assert!(matches!(decision, Decision::Accepted { event: None, came_back: false, .. }));
    }

    #[test]
    fn test_address_change_without_outage() {
        let mut device = seen_device();
        let decision = apply(&mut device, "203.0.113.7", t0() + Duration::seconds(60), &Limits::default());

        let Decision::Accepted { event: Some(event), .. } = decision else {
            panic!("expected an address event");
        };
        assert_eq!(event.downtime, None);
        assert_eq!(event.old_ip.as_deref(), Some(IP));
        assert_eq!(event.new_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(device.last_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(device.downtime, 0);
    }

    #[test]
    fn test_outage_and_address_change_share_one_event() {
        let mut device = seen_device();
        let decision = apply(&mut device, "203.0.113.7", t0() + Duration::seconds(400), &Limits::default());

        let Decision::Accepted { event: Some(event), .. } = decision else {
            panic!("expected one event");
        };
        assert_eq!(event.downtime, Some(400));
        assert_eq!(event.new_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(device.version, 1);
    }

    #[test]
    fn test_interval_is_clamped() {
        let limits = Limits::default();

        let mut device = seen_device();
        device.interval = 0;
        apply(&mut device, IP, t0() + Duration::seconds(60), &limits);
        assert_eq!(device.interval, 60);

        let mut device = seen_device();
        device.interval = 10_000;
        apply(&mut device, IP, t0() + Duration::seconds(60), &limits);
        assert_eq!(device.interval, 3600);
    }
}
