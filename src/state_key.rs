//! State-key derivation for `m.call.member` events (spec §4.3).
//!
//! A pure function of `(user_id, device_id, room_version)`, mirroring the
//! `_{user}_{device}` / `{user}_{device}` formatting rules in
//! `ruma-events::call::member::member_state_key::CallMemberStateKeyEnum`,
//! simplified to construction only (this crate never needs to parse an
//! arbitrary state key back into its parts).

/// Room versions that require the legacy `_`-prefixed state key namespace.
///
/// Rooms created under these versions put ordinary `@`-prefixed state keys
/// through the same auth rules as membership events, so call member events
/// must be prefixed with an extra `_` to exempt them.
fn needs_legacy_prefix(room_version: &str) -> bool {
    matches!(room_version, "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9" | "10")
}

/// Derives the `state_key` for a call member event.
pub fn derive_state_key(user_id: &str, device_id: &str, room_version: &str) -> String {
    if needs_legacy_prefix(room_version) {
        format!("_{user_id}_{device_id}")
    } else {
        format!("{user_id}_{device_id}")
    }
}
