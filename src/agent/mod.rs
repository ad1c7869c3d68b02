// The reconciliation controller: one idempotent tick plus the service loop
// around it.
pub mod reconcile;
pub mod service;
pub mod telemetry;
pub mod underlay;

use crate::api::ApiError;
use crate::net::error::NetError;
use crate::ospf::state::ParseError;
use crate::store::StoreError;
use crate::utils::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("network error: {0}")]
    Net(#[from] NetError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("controller error: {0}")]
    Api(#[from] ApiError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("router state error: {0}")]
    Ospf(#[from] ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("node settings missing; run 'networktools init' first")]
    SettingsMissing,
}

pub type AgentResult<T> = Result<T, AgentError>;
