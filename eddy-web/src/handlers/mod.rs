//! HTTP request handlers organized by functionality

pub mod actions;
pub mod remux;
pub mod status;
pub mod stream;

pub use actions::execute;
pub use remux::{remux_status, stream_remuxed};
pub use status::{StatusUpdate, status_events};
pub use stream::{head_file, stream_file};
