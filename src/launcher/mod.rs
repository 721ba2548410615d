//! Launcher daemon: starts programs through the spawner, tracks them until
//! they are up, and pools idle workers for reuse.

pub mod autostart;
pub mod control;
pub mod daemon;
pub mod names;
pub mod pool;
pub mod request;
pub mod services;
pub mod spawner_link;

pub use control::{ControlReply, ControlRequest, LauncherClient};
pub use daemon::{Launcher, EXIT_CONFIG, EXIT_SPAWNER_LOST};
pub use request::LaunchKind;
