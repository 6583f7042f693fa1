//! Shared components for the capture and watcher processes.
//!
//! The two processes never share memory: everything here either describes
//! data that travels through the durable streams (frames, log entries,
//! awareness levels) or is plumbing both sides need to reach those streams.

pub mod awareness;
pub mod encoder;
pub mod frame;
pub mod frame_source;
pub mod rolling;
pub mod room_config;
pub mod shutdown;
pub mod stream;
pub mod video_mirror;

pub use awareness::AwarenessLevel;
pub use frame::Frame;
