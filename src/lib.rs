//! Client side of a two-way audio intercom.
//!
//! One WebSocket carries control JSON and raw PCM16 audio to the device; an
//! HTTP status endpoint is polled alongside it. The session controller ties
//! the link, the microphone and the playback scheduler together.

pub mod audio;
pub mod config;
pub mod net_link;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod ui_bridge;
