//! Offline tooling for inspecting ECCONet/Matrix traffic captured from a bus.

pub mod candump;
pub mod stdio;
