//! The networking layer: wire codec, relay connections, the local listener, relay
//! selection, and the single-threaded scheduler that drives them all.

pub mod buffer;
pub mod frame;
pub mod local_listener;
pub mod pool;
pub mod relay;
pub mod select;

pub use buffer::Buffer;
pub use frame::Frame;
