// Routing-daemon support: LSDB parsing and configuration rendering.
pub mod config;
pub mod state;
