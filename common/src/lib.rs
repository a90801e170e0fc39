//! Types shared between the recorder service and its tooling.

pub mod camera;
pub mod config;
pub mod protocol;
