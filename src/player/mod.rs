//! Screen playback
//!
//! Each [`Screen`] owns one decode session, its frame queue and pacer, and
//! the host surface it draws into. The [`ScreenManager`] keeps every screen
//! in step with the server's sync broadcasts and ticks them from the
//! presentation thread.

mod manager;
mod screen;
mod state;

pub use manager::{normalize_world, world_compatible, ScreenManager, SurfaceFactory, TickReport, ViewerState, OVERLAY_INTERVAL};
pub use screen::{Screen, ScreenShared, TickInput};
pub use state::{download_line, timeline_line, DeletePrompt, ScreenPhase, ScreenStatus};
