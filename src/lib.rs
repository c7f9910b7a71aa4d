//! Playback agent for digital-signage devices.
//!
//! Pulls a playlist from the content server, keeps the referenced media in a
//! local cache, plays it in a loop and reports what was shown. Playback never
//! depends on the network once content is cached.

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod display;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod logs;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod sync;
