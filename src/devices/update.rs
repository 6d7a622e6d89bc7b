//! Owner edits to device settings.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

use crate::config::Limits;
use crate::db::Device;

/// Rejected owner edit. The message is shown to the user as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("incorrect interval")]
    IncorrectInterval,
    #[error("incorrect email")]
    IncorrectEmail,
    #[error("{0} is too long")]
    TooLong(&'static str),
}

/// Partial update of the owner-editable fields. Absent fields are left alone.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceUpdate {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub isp: Option<String>,
    pub battery: Option<bool>,
    pub reserve: Option<bool>,
    pub battery_comment: Option<String>,
    pub reserve_comment: Option<String>,
    pub public: Option<bool>,
    pub interval: Option<i64>,
    pub notify_interval: Option<i64>,
    pub email: Option<String>,
    #[serde(rename = "notifyoff")]
    pub notify_down: Option<bool>,
    #[serde(rename = "notifyon")]
    pub notify_up: Option<bool>,
}

impl DeviceUpdate {
    /// Apply the update field by field. On error the device may be partly
    /// modified, so callers apply it to a copy and only persist on success.
    pub fn apply(self, device: &mut Device, limits: &Limits) -> Result<(), ValidationError> {
        if let Some(title) = self.title {
            device.title = bounded("title", title, 30)?;
        }
        if let Some(notes) = self.notes {
            device.notes = notes;
        }
        if let Some(location) = self.location {
            device.location = bounded("location", location, 100)?;
        }
        if let Some(isp) = self.isp {
            device.isp = bounded("isp", isp, 50)?;
        }
        if let Some(battery) = self.battery {
            device.battery = battery;
        }
        if let Some(reserve) = self.reserve {
            device.reserve = reserve;
        }
        if let Some(comment) = self.battery_comment {
            device.battery_comment = bounded("battery_comment", comment, 100)?;
        }
        if let Some(comment) = self.reserve_comment {
            device.reserve_comment = bounded("reserve_comment", comment, 100)?;
        }
        if let Some(public) = self.public {
            device.public = public;
        }
        if let Some(interval) = self.interval {
            device.interval = checked_interval(interval, limits)?;
        }
        if let Some(interval) = self.notify_interval {
            device.notify_interval = checked_interval(interval, limits)?;
        }
        if let Some(email) = self.email {
            if device.email != email {
                device.email_confirmed = false;
            }
            if !email.is_empty() && !is_valid_email(&email) {
                return Err(ValidationError::IncorrectEmail);
            }
            device.email = bounded("email", email, 255)?;
        }
        if let Some(notify_down) = self.notify_down {
            device.notify_down = notify_down;
        }
        if let Some(notify_up) = self.notify_up {
            device.notify_up = notify_up;
        }
        Ok(())
    }
}

fn checked_interval(value: i64, limits: &Limits) -> Result<i64, ValidationError> {
    if limits.interval_in_range(value) {
        Ok(value)
    } else {
        Err(ValidationError::IncorrectInterval)
    }
}

fn bounded(field: &'static str, value: String, max_chars: usize) -> Result<String, ValidationError> {
    if value.chars().count() > max_chars {
        return Err(ValidationError::TooLong(field));
    }
    Ok(value)
}

/// Loose email check: something@something, word characters at both ends.
pub fn is_valid_email(email: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\b$").expect("email pattern compiles")
    });
    re.is_match(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        let mut device = Device::new(60, 150);
        device.email = "old@example.com".to_string();
        device.email_confirmed = true;
        device
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("first.last+tag@mail.example.org"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@example.com."));
        assert!(!is_valid_email("a b@example.com"));
    }

    #[test]
    fn test_partial_update_touches_only_given_fields() {
        let mut device = device();
        let update = DeviceUpdate {
            title: Some("Dacha".to_string()),
            public: Some(true),
            ..Default::default()
        };

        update.apply(&mut device, &Limits::default()).unwrap();

        assert_eq!(device.title, "Dacha");
        assert!(device.public);
        assert_eq!(device.interval, 60);
        assert!(device.email_confirmed);
    }

    #[test]
    fn test_wire_names() {
        let update: DeviceUpdate =
            serde_json::from_str(r#"{"notifyoff": true, "notifyon": false, "interval": 120}"#).unwrap();
        assert_eq!(update.notify_down, Some(true));
        assert_eq!(update.notify_up, Some(false));
        assert_eq!(update.interval, Some(120));
        assert_eq!(update.title, None);
    }

    #[test]
    fn test_interval_out_of_range() {
        let limits = Limits::default();
        for value in [59, 3601, 0, -5] {
            let mut device = device();
            let update = DeviceUpdate {
                notify_interval: Some(value),
                ..Default::default()
            };
            assert_eq!(
                update.apply(&mut device, &limits),
                Err(ValidationError::IncorrectInterval)
            );
        }
    }

    #[test]
    fn test_changed_email_is_unconfirmed() {
        let mut device = device();
        let update = DeviceUpdate {
            email: Some("new@example.com".to_string()),
            ..Default::default()
        };
        update.apply(&mut device, &Limits::default()).unwrap();
        assert_eq!(device.email, "new@example.com");
        assert!(!device.email_confirmed);
    }

    #[test]
    fn test_same_email_stays_confirmed() {
        let mut device = device();
        let update = DeviceUpdate {
            email: Some("old@example.com".to_string()),
            ..Default::default()
        };
        update.apply(&mut device, &Limits::default()).unwrap();
        assert!(device.email_confirmed);
    }

    #[test]
    fn test_empty_email_clears_address() {
        let mut device = device();
        let update = DeviceUpdate {
            email: Some(String::new()),
            ..Default::default()
        };
        update.apply(&mut device, &Limits::default()).unwrap();
        assert!(device.email.is_empty());
        assert!(!device.email_confirmed);
    }

    #[test]
    fn test_invalid_email_rejected() {
        let mut device = device();
        let update = DeviceUpdate {
            email: Some("broken".to_string()),
            ..Default::default()
        };
        assert_eq!(
            update.apply(&mut device, &Limits::default()),
            Err(ValidationError::IncorrectEmail)
        );
    }

    #[test]
    fn test_title_too_long() {
        let mut device = device();
        let update = DeviceUpdate {
            title: Some("x".repeat(31)),
            ..Default::default()
        };
        assert_eq!(
            update.apply(&mut device, &Limits::default()),
            Err(ValidationError::TooLong("title"))
        );
    }
}
