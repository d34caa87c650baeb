//! Carousel pairs anonymous participants into two-party audio/video
//! sessions and brokers the WebRTC signaling handshake between them.
//!
//! The hard part is the matchmaking and session state machine: who is
//! waiting, who is paired, who owns which media transports, kept correct
//! under connection churn. Media routing itself is delegated to an external
//! SFU engine consumed behind the [`media::MediaEngine`] boundary; the
//! shipped binary runs engine-less as a pure signaling relay.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod matchmaker;
pub mod media;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod transports;
pub mod websocket;

pub use config::Config;
pub use websocket::AppState;
