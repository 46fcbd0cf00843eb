//! The Membership Record: a typed, validated representation of one device's
//! announcement in a MatrixRTC session, plus the tagged-union wire types it
//! is built from.
//!
//! Field shapes mirror `ruma-events::call::member::{member_data, focus}`
//! (the `m.call` / livekit-only slice of MSC3401 this crate implements),
//! but this crate owns its own serde types rather than depending on
//! `ruma-events` directly. The Matrix event/timeline layer is an external
//! collaborator per the crate's scope, not something this core re-exports.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The session-level application a membership belongs to.
///
/// Only the `m.call` application is implemented; an unrecognised
/// `application` tag is rejected at construction (see
/// [`RecordValidationError`]) because the spec gives this crate no notion of
/// what such a membership would even mean for session bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "application")]
pub enum Application {
    #[serde(rename = "m.call")]
    Call(CallApplicationContent),
}

/// Call-specific parameters of an `m.call.member` membership.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CallApplicationContent {
    /// Groups announcements into a logical session. `""` for the default,
    /// room-wide session.
    pub call_id: String,
    /// Who owns/joins/controls the call.
    pub scope: CallScope,
}

/// Call ownership model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallScope {
    #[serde(rename = "m.room")]
    Room,
    #[serde(rename = "m.user")]
    User,
}

/// Description of an SFU/focus a membership can be connected to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Focus {
    Livekit(LivekitFocus),
    /// A focus type this crate doesn't implement. Other devices are free to
    /// propose foci this client can't use; that alone doesn't invalidate
    /// the membership.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LivekitFocus {
    #[serde(rename = "livekit_alias")]
    pub alias: String,
    #[serde(rename = "livekit_service_url")]
    pub service_url: String,
}

/// Data describing which focus is actively in use, and how it was chosen.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActiveFocus {
    Livekit(ActiveLivekitFocus),
    /// A foreign focus-selection scheme this crate doesn't interpret.
    /// [`MembershipRecord::focus_selection`] returns `None` for it.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActiveLivekitFocus {
    pub focus_selection: FocusSelection,
}

/// How the active livekit focus is chosen.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FocusSelection {
    /// Whichever device joined first picks the focus for everyone.
    OldestMembership,
    /// A selection policy this crate doesn't recognise.
    #[serde(other)]
    Unknown,
}

/// The `m.call.member` content shape for a joined device (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMembershipContent {
    #[serde(flatten)]
    pub application: Application,
    pub device_id: String,
    /// Relative validity window in milliseconds from `created_ts`.
    pub expires: u64,
    /// Origin timestamp in milliseconds since the Unix epoch. Absent on the
    /// wire for the initial event of a session; the Observer fills it in
    /// from the enclosing state event's `origin_server_ts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<i64>,
    pub focus_active: ActiveFocus,
    #[serde(default)]
    pub foci_preferred: Vec<Focus>,
}

/// Content of a left membership: `{}`, optionally with a leave reason
/// (supplement over the distilled spec, present in the ecosystem's actual
/// `MemberEventContent::Empty`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EmptyMembershipContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave_reason: Option<String>,
}

/// The raw, untyped shape of `m.call.member` content as it can appear on the
/// wire. Recognising which shape a given JSON object is, is a precondition
/// for constructing a [`MembershipRecord`] at all (spec §4.4 rule 2).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MembershipContent {
    Session(SessionMembershipContent),
    Empty(EmptyMembershipContent),
}

/// Accumulated field-level problems found while validating a raw
/// announcement. Construction accumulates every problem found rather than
/// stopping at the first one (spec §4.1).
#[derive(Debug, thiserror::Error)]
#[error("invalid membership announcement: {}", .0.join("; "))]
pub struct RecordValidationError(pub Vec<String>);

/// A typed, validated representation of one device's announcement.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipRecord {
    pub sender: String,
    pub device_id: String,
    pub call_id: String,
    pub application_tag: &'static str,
    pub scope: CallScope,
    pub expires_ms: u64,
    created_ts_ms: i64,
    pub focus_active: ActiveFocus,
    pub foci_preferred: Vec<Focus>,
}

impl MembershipRecord {
    /// Builds a [`MembershipRecord`] from a raw content object plus the
    /// enclosing state event's sender and server timestamp (used as the
    /// `created_ts` fallback).
    ///
    /// Returns every validation error found, not just the first (spec
    /// §4.1). Only [`MembershipContent::Session`] content can produce a
    /// record; `Empty` content means "not a participant" and has no
    /// membership to construct.
    pub fn from_content(
        sender: impl Into<String>,
        content: &JsonValue,
        origin_server_ts_ms: i64,
    ) -> Result<Option<Self>, RecordValidationError> {
        let mut errors = Vec::new();

        if content.as_object().is_none_or(|o| o.is_empty()) {
            // An empty object means "left". Not an error, not a record.
            return Ok(None);
        }

        let parsed: SessionMembershipContent = match serde_json::from_value(content.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                errors.push(format!("content does not match a session membership: {err}"));
                return Err(RecordValidationError(errors));
            }
        };

        if parsed.device_id.is_empty() {
            errors.push("device_id must not be empty".to_owned());
        }

        let Application::Call(CallApplicationContent { call_id, scope }) = &parsed.application;

        if !errors.is_empty() {
            return Err(RecordValidationError(errors));
        }

        let created_ts_ms = parsed.created_ts.unwrap_or(origin_server_ts_ms);

        Ok(Some(MembershipRecord {
            sender: sender.into(),
            device_id: parsed.device_id,
            call_id: call_id.clone(),
            application_tag: "m.call",
            scope: *scope,
            expires_ms: parsed.expires,
            created_ts_ms,
            focus_active: parsed.focus_active,
            foci_preferred: parsed.foci_preferred,
        }))
    }

    pub fn created_ts(&self) -> i64 {
        self.created_ts_ms
    }

    pub fn expiry_absolute(&self) -> i64 {
        self.created_ts_ms + self.expires_ms as i64
    }

    pub fn ms_until_expiry(&self, now_ms: i64) -> i64 {
        self.expiry_absolute() - now_ms
    }

    /// Expiry is boundary-inclusive: exactly at the deadline counts as expired.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ms_until_expiry(now_ms) <= 0
    }

    pub fn preferred_foci(&self) -> &[Focus] {
        &self.foci_preferred
    }

    /// The selection policy this membership's `focus_active` uses, if this
    /// crate recognises it.
    pub fn focus_selection(&self) -> Option<FocusSelection> {
        match &self.focus_active {
            ActiveFocus::Livekit(ActiveLivekitFocus {
                focus_selection: FocusSelection::Unknown,
            }) => None,
            ActiveFocus::Livekit(ActiveLivekitFocus { focus_selection }) => Some(*focus_selection),
            ActiveFocus::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_content() -> JsonValue {
        json!({
            "call_id": "",
            "scope": "m.room",
            "application": "m.call",
            "device_id": "DEVICE",
            "expires": 14_400_000u64,
            "focus_active": { "type": "livekit", "focus_selection": "oldest_membership" },
            "foci_preferred": [
                { "type": "livekit", "livekit_alias": "alias", "livekit_service_url": "https://sfu.example" }
            ],
        })
    }

    #[test]
    fn constructs_from_valid_content() {
        let record = MembershipRecord::from_content("@alice:example.org", &valid_content(), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(record.sender, "@alice:example.org");
        assert_eq!(record.device_id, "DEVICE");
        assert_eq!(record.call_id, "");
        assert_eq!(record.scope, CallScope::Room);
        assert_eq!(record.created_ts(), 1_000);
        assert_eq!(record.expiry_absolute(), 1_000 + 14_400_000);
        assert_eq!(record.focus_selection(), Some(FocusSelection::OldestMembership));
    }

    #[test]
    fn empty_content_is_not_a_record() {
        assert!(
            MembershipRecord::from_content("@alice:example.org", &json!({}), 1_000)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn created_ts_defaults_to_origin_server_ts() {
        let mut content = valid_content();
        content
            .as_object_mut()
            .unwrap()
            .remove("created_ts");
        let record = MembershipRecord::from_content("@a:x", &content, 42).unwrap().unwrap();
        assert_eq!(record.created_ts(), 42);
    }

    #[test]
    fn explicit_created_ts_wins_over_origin_server_ts() {
        let mut content = valid_content();
        content["created_ts"] = json!(7);
        let record = MembershipRecord::from_content("@a:x", &content, 42).unwrap().unwrap();
        assert_eq!(record.created_ts(), 7);
    }

    #[test]
    fn rejects_missing_device_id() {
        let mut content = valid_content();
        content.as_object_mut().unwrap().remove("device_id");
        let err = MembershipRecord::from_content("@a:x", &content, 0).unwrap_err();
        assert!(!err.0.is_empty());
    }

    #[test]
    fn is_expired_is_boundary_inclusive() {
        let record = MembershipRecord::from_content("@a:x", &valid_content(), 0).unwrap().unwrap();
        assert!(!record.is_expired(record.expiry_absolute() - 1));
        assert!(record.is_expired(record.expiry_absolute()));
        assert!(record.is_expired(record.expiry_absolute() + 1));
    }

    #[test]
    fn unrecognised_focus_selection_is_none() {
        let mut content = valid_content();
        content["focus_active"]["focus_selection"] = json!("some_future_policy");
        let record = MembershipRecord::from_content("@a:x", &content, 0).unwrap().unwrap();
        assert_eq!(record.focus_selection(), None);
    }

    #[test]
    fn unrecognised_focus_type_is_structurally_accepted() {
        let mut content = valid_content();
        content["focus_active"] = json!({ "type": "some_future_sfu", "detail": "x" });
        let record = MembershipRecord::from_content("@a:x", &content, 0).unwrap().unwrap();
        assert_eq!(record.focus_selection(), None);
    }

    #[test]
    fn two_records_from_identical_content_are_equal() {
        let a = MembershipRecord::from_content("@a:x", &valid_content(), 5).unwrap().unwrap();
        let b = MembershipRecord::from_content("@a:x", &valid_content(), 5).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn round_trip_through_serialization_preserves_equality() {
        let record = MembershipRecord::from_content("@a:x", &valid_content(), 5).unwrap().unwrap();
        let wire = SessionMembershipContent {
            application: Application::Call(CallApplicationContent {
                call_id: record.call_id.clone(),
                scope: record.scope,
            }),
            device_id: record.device_id.clone(),
            expires: record.expires_ms,
            created_ts: Some(record.created_ts()),
            focus_active: record.focus_active.clone(),
            foci_preferred: record.foci_preferred.clone(),
        };
        let json = serde_json::to_value(&wire).unwrap();
        let round_tripped = MembershipRecord::from_content("@a:x", &json, 5).unwrap().unwrap();
        assert_eq!(record, round_tripped);
    }
}
