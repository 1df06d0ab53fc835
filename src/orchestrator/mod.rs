//! Session orchestration modules.
//!
//! Covers the session controller and its background collaborators:
//! ownership claims, heartbeat, the section countdown and submission.

pub mod controller;
pub mod heartbeat;
pub mod instance_guard;
pub mod session_timer;
pub mod submission;
pub mod view;
