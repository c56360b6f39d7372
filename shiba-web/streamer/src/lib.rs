//! Capture, encoding and delivery of a room's shared browser stream.

pub mod bringup;
pub mod capture;
pub mod forward;
pub mod peer;
pub mod pipeline;
pub mod process;
