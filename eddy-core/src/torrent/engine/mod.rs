//! Torrent engine: registry of running sessions behind an actor.

mod actor;
mod commands;
mod handle;

pub use actor::spawn_engine;
pub use commands::TorrentSource;
pub use handle::EngineHandle;
