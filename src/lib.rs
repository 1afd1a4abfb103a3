//! Collins screen client
//!
//! Plays remote or local videos onto in-world screens, kept in step with a
//! server-owned timeline. The pieces:
//!
//! - [`net`] resolves share links and probes URLs
//! - [`cache`] keeps whole-file downloads on disk
//! - [`decoder`] runs one decode thread per screen
//! - [`audio`] feeds decoded PCM to the output device
//! - [`sync`] carries the screen timeline protocol
//! - [`player`] drives each screen's state machine

pub mod audio;
pub mod cache;
pub mod decoder;
pub mod net;
pub mod player;
pub mod renderer;
pub mod sync;
pub mod utils;
