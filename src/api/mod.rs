// Controller-facing wire surface.
pub mod client;
pub mod model;

pub use client::{ApiError, ApiResult, ControllerClient};
