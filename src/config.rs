//! Configuration module for Blackouts.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the web server (default: "127.0.0.1:8000")
    pub http_addr: String,
    /// Path to the SQLite database file (default: "blackouts.db")
    pub db_path: String,
    /// Shared secret a reverse proxy puts into its `Forwarded` header.
    /// When unset the peer address of the TCP connection is used.
    pub forwarded_secret: Option<String>,
    /// CORS origin (default: "*")
    pub allow_origin: String,
    pub limits: Limits,
    pub mail: MailConfig,
}

/// Tunables of the heartbeat engine, the registry and the throttles.
///
/// All durations are in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Lower bound for `interval` and `notify_interval`.
    pub min_interval: i64,
    /// Upper bound for `interval` and `notify_interval`.
    pub max_interval: i64,
    /// A gap longer than `interval * blackout_coefficient` is recorded as downtime.
    pub blackout_coefficient: f64,
    pub default_interval: i64,
    /// Verification codes sent per device per day.
    pub email_max_sent: i64,
    /// Wrong verification codes accepted before the device is blocked.
    pub email_vcode_attempt: i64,
    /// Registrations per source address per day.
    pub reg_per_ip: i64,
    /// Observers silent for longer than this are purged on the next notify.
    pub websocket_timeout: i64,
    /// Minimum gap between two wildcard notifications.
    pub asterisk_min_time: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_interval: 60,
            max_interval: 3600,
            blackout_coefficient: 2.5,
            default_interval: 60,
            email_max_sent: 3,
            email_vcode_attempt: 6,
            reg_per_ip: 5,
            websocket_timeout: 50,
            asterisk_min_time: 5,
        }
    }
}

impl Limits {
    /// `notify_interval` given to freshly registered devices.
    pub fn default_notify_interval(&self) -> i64 {
        (self.default_interval as f64 * self.blackout_coefficient) as i64
    }

    /// Whether `value` is an acceptable interval or notify interval.
    pub fn interval_in_range(&self, value: i64) -> bool {
        (self.min_interval..=self.max_interval).contains(&value)
    }

    /// Replaces an unset interval with the default and clamps it into range.
    pub fn clamp_interval(&self, value: i64) -> i64 {
        let value = if value <= 0 { self.default_interval } else { value };
        value.clamp(self.min_interval, self.max_interval)
    }

    fn load(&mut self) {
        env_override("BLACKOUTS_MIN_INTERVAL", &mut self.min_interval);
        env_override("BLACKOUTS_MAX_INTERVAL", &mut self.max_interval);
        env_override("BLACKOUTS_BLACKOUT_COEFFICIENT", &mut self.blackout_coefficient);
        env_override("BLACKOUTS_DEFAULT_INTERVAL", &mut self.default_interval);
        env_override("BLACKOUTS_EMAIL_MAX_SENT", &mut self.email_max_sent);
        env_override("BLACKOUTS_EMAIL_VCODE_ATTEMPT", &mut self.email_vcode_attempt);
        env_override("BLACKOUTS_REG_PER_IP", &mut self.reg_per_ip);
        env_override("BLACKOUTS_WEBSOCKET_TIMEOUT", &mut self.websocket_timeout);
        env_override("BLACKOUTS_ASTERISK_MIN_TIME", &mut self.asterisk_min_time);
        self.sanitize();
    }

    /// Reset overrides that contradict each other back to their defaults.
    fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.min_interval <= 0 || self.max_interval < self.min_interval {
            tracing::warn!(
                min = self.min_interval,
                max = self.max_interval,
                "Ignoring invalid interval bounds"
            );
            self.min_interval = defaults.min_interval;
            self.max_interval = defaults.max_interval;
        }
        if self.default_interval <= 0 {
            tracing::warn!(value = self.default_interval, "Ignoring invalid default interval");
            self.default_interval = defaults.default_interval;
        }
        if !(self.blackout_coefficient.is_finite() && self.blackout_coefficient > 0.0) {
            tracing::warn!(value = self.blackout_coefficient, "Ignoring invalid blackout coefficient");
            self.blackout_coefficient = defaults.blackout_coefficient;
        }
        if self.websocket_timeout <= 0 {
            tracing::warn!(value = self.websocket_timeout, "Ignoring invalid websocket timeout");
            self.websocket_timeout = defaults.websocket_timeout;
        }
        if self.asterisk_min_time < 0 {
            tracing::warn!(value = self.asterisk_min_time, "Ignoring invalid wildcard throttle");
            self.asterisk_min_time = defaults.asterisk_min_time;
        }
    }
}

/// Outbound mail settings.
#[derive(Debug, Clone, Default)]
pub struct MailConfig {
    /// SMTP server hostname. Letters are only logged when unset.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    /// RFC 5322 "From" address.
    pub from_address: String,
    /// Base URL of the frontend, used for settings and view links.
    pub site_url: String,
    /// Prefix of the unsubscribe link; the edit token is appended.
    pub unsubscribe_url: String,
    /// Public domain name shown in letters.
    pub domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8000".to_string(),
            db_path: "blackouts.db".to_string(),
            forwarded_secret: None,
            allow_origin: "*".to_string(),
            limits: Limits::default(),
            mail: MailConfig {
                smtp_port: 587,
                from_address: "Blackouts <noreply@blackouts.example.com>".to_string(),
                site_url: "https://blackouts.example.com".to_string(),
                unsubscribe_url: "https://blackouts.example.com/u/unsubscribe/".to_string(),
                domain: "blackouts.example.com".to_string(),
                ..Default::default()
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BLACKOUTS_HTTP_ADDR`: listen address (default: 127.0.0.1:8000)
    /// - `BLACKOUTS_DB_PATH`: database file path (default: "blackouts.db")
    /// - `BLACKOUTS_FORWARDED_SECRET`: trusted proxy secret (default: unset)
    /// - `BLACKOUTS_ALLOW_ORIGIN`: CORS origin (default: "*")
    /// - `BLACKOUTS_<LIMIT>`: any field of [`Limits`], upper-cased
    /// - `SMTP_HOST`, `SMTP_PORT`, `SMTP_USER`, `SMTP_PASSWORD`, `SMTP_FROM`
    /// - `BLACKOUTS_SITE_URL`, `BLACKOUTS_UNSUBSCRIBE_URL`, `BLACKOUTS_DOMAIN`
    pub fn load() -> Self {
        let mut cfg = Self::default();

        env_override("BLACKOUTS_HTTP_ADDR", &mut cfg.http_addr);
        env_override("BLACKOUTS_DB_PATH", &mut cfg.db_path);
        env_override("BLACKOUTS_ALLOW_ORIGIN", &mut cfg.allow_origin);
        cfg.forwarded_secret = env::var("BLACKOUTS_FORWARDED_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        cfg.limits.load();

        let mail = &mut cfg.mail;
        mail.smtp_host = env::var("SMTP_HOST").ok().filter(|s| !s.is_empty());
        mail.smtp_user = env::var("SMTP_USER").ok();
        mail.smtp_password = env::var("SMTP_PASSWORD").ok();
        env_override("SMTP_PORT", &mut mail.smtp_port);
        env_override("SMTP_FROM", &mut mail.from_address);
        env_override("BLACKOUTS_SITE_URL", &mut mail.site_url);
        env_override("BLACKOUTS_UNSUBSCRIBE_URL", &mut mail.unsubscribe_url);
        env_override("BLACKOUTS_DOMAIN", &mut mail.domain);

        cfg
    }
}

/// Overwrite `slot` with the parsed value of `key` when it is set and valid.
fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw),
        }
    }
}
