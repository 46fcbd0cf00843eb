//! matrixrtc-membership: the session-membership core of a MatrixRTC
//! (MSC3401) client. Announces, heartbeats, and withdraws one device's
//! participation in a room-hosted real-time session.
//!
//! Joining a session means more than sending one state event: the
//! announcement has to be kept alive while the device is connected, and
//! withdrawn promptly even if the process crashes or the network drops
//! without warning. This crate owns that lifecycle.
//!
//! # Components
//!
//! Five cooperating pieces, leaves first:
//!
//! - [`MembershipRecord`] (a typed, validated view of one device's
//!   announcement).
//! - [`Scheduler`] (the single-threaded timed action queue the Manager runs
//!   its protocol on).
//! - [`Manager`] (drives the join/heartbeat/expiry/leave protocol against a
//!   [`ClientFacade`]).
//! - [`SessionObserver`] (reads room state into the session's ordered
//!   membership list and detects changes).
//! - [`ClientFacade`] (the narrow interface this crate needs from a Matrix
//!   client; [`MatrixSdkFacade`] implements it over `matrix_sdk`).
//!
//! What this crate does *not* do: hold a Matrix session, speak WebRTC, store
//! anything across restarts, or derive encryption key material. Those are
//! the caller's job; this crate only emits the signals that tell the caller
//! when to do them.
//!
//! See `demos/membership-demo.rs` for a minimal end-to-end wiring.

mod clock;
mod config;
mod error;
mod facade;
mod manager;
mod membership;
mod observer;
mod scheduler;
mod state_key;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::Config;
pub use error::{FacadeError, Result};
pub use facade::{ClientFacade, DelayedEventAction, MatrixSdkFacade};
pub use manager::{ActionType, Manager, ManagerStatus, StatusChanged, UnrecoverableError, EVENT_TYPE};
pub use membership::{
    ActiveFocus, ActiveLivekitFocus, Application, CallApplicationContent, CallScope,
    EmptyMembershipContent, Focus, FocusSelection, LivekitFocus, MembershipContent,
    MembershipRecord, RecordValidationError, SessionMembershipContent,
};
pub use observer::{EncryptionHook, MembershipsChanged, RawMemberEvent, RoomStateSource, SessionMemberHook, SessionObserver};
pub use scheduler::{Action, ActionHandler, ActionUpdate, Scheduler, WakeUp};
pub use state_key::derive_state_key;
