//! Database model types.

use chrono::{DateTime, Utc};

/// One monitored endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: i64,
    pub title: String,
    pub notes: String,
    pub country: String,
    pub location: String,
    pub isp: String,
    pub battery: bool,
    pub reserve: bool,
    pub battery_comment: String,
    pub reserve_comment: String,
    /// Listed on the main page and addressable by numeric id.
    pub public: bool,
    /// Desired heartbeat period in seconds.
    pub interval: i64,
    /// Delay in seconds before a down alert is mailed.
    pub notify_interval: i64,
    pub email: String,
    /// Verification codes sent in the current 24h window.
    pub email_count: i64,
    /// Start of the current 24h verification window.
    pub email_sent: Option<DateTime<Utc>>,
    pub email_vcode: Option<String>,
    /// Wrong verification codes entered in the current window.
    pub email_errors: i64,
    pub email_confirmed: bool,
    pub notify_down: bool,
    pub notify_up: bool,
    /// Registration time, reset by the first heartbeat.
    pub created: Option<DateTime<Utc>>,
    pub edit_token: Option<String>,
    pub view_token: Option<String>,
    pub update_token: Option<String>,
    /// Source address of the last heartbeat (or of the registration).
    pub last_ip: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Cumulative detected outage in seconds.
    pub downtime: i64,
    /// `downtime` minus the downtime of crossed events.
    pub downtime_uncrossed: i64,
    /// Bumped whenever observers should drop cached state.
    pub version: i64,
    /// Latched by the down-alert scan, cleared by the next heartbeat.
    pub notified_down: bool,
}

impl Device {
    /// A blank device with the given interval settings, as stored by registration.
    pub fn new(interval: i64, notify_interval: i64) -> Self {
        Self {
            id: 0,
            title: "Untitled device".to_string(),
            notes: String::new(),
            country: String::new(),
            location: String::new(),
            isp: String::new(),
            battery: false,
            reserve: false,
            battery_comment: String::new(),
            reserve_comment: String::new(),
            public: false,
            interval,
            notify_interval,
            email: String::new(),
            email_count: 0,
            email_sent: None,
            email_vcode: None,
            email_errors: 0,
            email_confirmed: false,
            notify_down: false,
            notify_up: false,
            created: None,
            edit_token: None,
            view_token: None,
            update_token: None,
            last_ip: None,
            last_seen: None,
            downtime: 0,
            downtime_uncrossed: 0,
            version: 0,
            notified_down: false,
        }
    }

    /// Returns the token of the given kind, if the device still has one.
    pub fn token(&self, kind: TokenKind) -> Option<&str> {
        match kind {
            TokenKind::Edit => self.edit_token.as_deref(),
            TokenKind::View => self.view_token.as_deref(),
            TokenKind::Update => self.update_token.as_deref(),
        }
    }

    pub fn set_token(&mut self, kind: TokenKind, value: Option<String>) {
        match kind {
            TokenKind::Edit => self.edit_token = value,
            TokenKind::View => self.view_token = value,
            TokenKind::Update => self.update_token = value,
        }
    }
}

/// The three independent secrets of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Edit,
    View,
    Update,
}

impl TokenKind {
    pub const ALL: [TokenKind; 3] = [TokenKind::View, TokenKind::Update, TokenKind::Edit];

    /// Column holding this token.
    pub fn column(self) -> &'static str {
        match self {
            TokenKind::Edit => "edit_token",
            TokenKind::View => "view_token",
            TokenKind::Update => "update_token",
        }
    }

    /// Parses the short names used by the API ("edit", "view", "update").
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "edit" => Some(TokenKind::Edit),
            "view" => Some(TokenKind::View),
            "update" => Some(TokenKind::Update),
            _ => None,
        }
    }
}

/// One observation window of a device: an outage, an address change, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub device_id: i64,
    /// Absent for the first event of a device.
    pub started: Option<DateTime<Utc>>,
    pub ended: DateTime<Utc>,
    /// Absent when the event only records an address change.
    pub downtime: Option<i64>,
    pub old_ip: Option<String>,
    pub new_ip: Option<String>,
    pub comment: Option<String>,
    /// Excluded from `downtime_uncrossed` by the owner.
    pub crossed: bool,
}

/// An event produced by the heartbeat engine, not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub started: Option<DateTime<Utc>>,
    pub ended: DateTime<Utc>,
    pub downtime: Option<i64>,
    pub old_ip: Option<String>,
    pub new_ip: Option<String>,
}

impl NewEvent {
    /// An empty observation window closing at `ended`.
    pub fn new(ended: DateTime<Utc>) -> Self {
        Self {
            started: None,
            ended,
            downtime: None,
            old_ip: None,
            new_ip: None,
        }
    }

    /// Only outages and address changes are worth keeping.
    pub fn is_worth_storing(&self) -> bool {
        self.downtime.is_some() || self.new_ip.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_kind_parse() {
        assert_eq!(TokenKind::parse("edit"), Some(TokenKind::Edit));
        assert_eq!(TokenKind::parse("view"), Some(TokenKind::View));
        assert_eq!(TokenKind::parse("update"), Some(TokenKind::Update));
        assert_eq!(TokenKind::parse("id"), None);
    }

    #[test]
    fn test_new_event_worth_storing() {
        let now = Utc::now();
        assert!(!NewEvent::new(now).is_worth_storing());
        assert!(NewEvent { downtime: Some(200), ..NewEvent::new(now) }.is_worth_storing());
        assert!(NewEvent { new_ip: Some("10.0.0.1".into()), ..NewEvent::new(now) }.is_worth_storing());
    }
}
