//! Tracker communication for peer discovery.

pub mod client;
pub mod types;

pub use client::HttpTrackerClient;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
