//! Configuration for the Membership Manager and Session Observer.
//!
//! A plain, doc-commented field struct in the same spirit as the teacher's
//! `SetupConfig` (no builder macro, just public fields and a `Default`
//! impl). Loading configuration from a file or environment is out of scope
//! (spec's "configuration plumbing" Non-goal); what this crate does provide
//! is [`Config::from_json_value`], a small loader that accepts the two
//! documented deprecated field-name aliases (design note §9) and warns when
//! one is used.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Validity window advertised on the live announcement.
    pub membership_event_expiry_ms: u64,
    /// How long before an announcement's expiry the Manager re-sends it.
    pub membership_event_expiry_headroom_ms: u64,
    /// Delay requested when registering the server-side scheduled leave.
    pub delayed_leave_event_delay_ms: u64,
    /// How often the Manager heartbeats (restarts) the scheduled leave.
    pub delayed_leave_event_restart_ms: u64,
    /// Rate-limit retry budget, per action type.
    pub max_rate_limit_retry_count: u32,
    /// Network-error retry budget, per action type.
    pub max_network_error_retry_count: u32,
    /// Delay before retrying after a transient network error.
    pub network_error_retry_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            membership_event_expiry_ms: 14_400_000,
            membership_event_expiry_headroom_ms: 5_000,
            delayed_leave_event_delay_ms: 8_000,
            delayed_leave_event_restart_ms: 5_000,
            max_rate_limit_retry_count: 10,
            max_network_error_retry_count: 10,
            network_error_retry_ms: 3_000,
        }
    }
}

impl Config {
    /// Loads a [`Config`] from a JSON object, starting from [`Config::default`]
    /// and overriding any canonical field present. Also accepts the two
    /// documented deprecated names, logging a warning when used:
    ///
    /// * `expiry_headroom_ms` → `membership_event_expiry_headroom_ms`
    /// * `min_retry_delay_ms` → `network_error_retry_ms`
    pub fn from_json_value(value: &serde_json::Value) -> Self {
        let mut config = Config::default();
        let Some(obj) = value.as_object() else {
            return config;
        };

        macro_rules! apply_u64 {
            ($field:ident, $canonical:literal $(, deprecated = $deprecated:literal)?) => {
                if let Some(v) = obj.get($canonical).and_then(|v| v.as_u64()) {
                    config.$field = v;
                }
                $(
                    else if let Some(v) = obj.get($deprecated).and_then(|v| v.as_u64()) {
                        warn!(
                            deprecated = $deprecated,
                            canonical = $canonical,
                            "config uses a deprecated field name; prefer the canonical name"
                        );
                        config.$field = v;
                    }
                )?
            };
        }

        apply_u64!(membership_event_expiry_ms, "membership_event_expiry_ms");
        apply_u64!(
            membership_event_expiry_headroom_ms,
            "membership_event_expiry_headroom_ms",
            deprecated = "expiry_headroom_ms"
        );
        apply_u64!(delayed_leave_event_delay_ms, "delayed_leave_event_delay_ms");
        apply_u64!(delayed_leave_event_restart_ms, "delayed_leave_event_restart_ms");
        apply_u64!(network_error_retry_ms, "network_error_retry_ms", deprecated = "min_retry_delay_ms");

        if let Some(v) = obj.get("max_rate_limit_retry_count").and_then(|v| v.as_u64()) {
            config.max_rate_limit_retry_count = v as u32;
        }
        if let Some(v) = obj.get("max_network_error_retry_count").and_then(|v| v.as_u64()) {
            config.max_network_error_retry_count = v as u32;
        }

        config
    }
}
