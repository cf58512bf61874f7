//! HLS delivery: rotating TS segments plus playlist and session handling.
//!
//! - [`fragment`]: one on-disk segment and the sliding window over them
//! - [`muxer`]: consumes a live stream, cuts segments, writes the playlist
//! - [`session`]: virtual connections for playlist/segment requests

pub mod fragment;
pub mod muxer;
pub mod session;

pub use fragment::{Fragment, FragmentWindow};
pub use muxer::{HlsConfig, HlsController, HlsMuxer};
pub use session::{HlsSession, HlsSessionStore};
