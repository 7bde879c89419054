//! Spillway Web - HTTP relay surface and status API
//!
//! Serves the live byte relay (`/{site_id}/stream`), segmented playlists
//! (`/hls/...`), and the status/playlist endpoints downstream tuners and
//! dashboards consume.

pub mod handlers;
pub mod server;

pub use server::{AppState, router, run_server};
