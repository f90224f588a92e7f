// Unitpanel - single-flight control and log tailing for game server units
// Library root

pub mod config;
pub mod control;
pub mod error;
pub mod version;
