//! Process roles assembled from workers: the ground-station backend (IMM)
//! and the drone relay emulator (RDS).

pub mod imm;
pub mod rds;

use std::fmt;
use std::sync::Arc;

use crate::channel::TransportContext;
use crate::config::AppConfig;
use crate::coordinator::{CoordinatorError, ThreadCoordinator};
use crate::dispatch::DispatchError;
use crate::store::{ImageStore, InMemoryImageStore, StoreError};

pub use imm::ImmBackend;
pub use rds::{DroneSimulator, RdsEmulator};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Imm,
    Rds,
}

impl Role {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "imm" => Some(Self::Imm),
            "rds" => Some(Self::Rds),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imm => "imm",
            Self::Rds => "rds",
        }
    }
}

#[derive(Debug)]
pub enum RoleError {
    InvalidSetting { key: &'static str, value: String },
    Store(StoreError),
    Dispatch(DispatchError),
    Coordinator(CoordinatorError),
}

impl fmt::Display for RoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSetting { key, value } => write!(f, "invalid {key} '{value}'"),
            Self::Store(source) => write!(f, "store error: {source}"),
            Self::Dispatch(source) => write!(f, "{source}"),
            Self::Coordinator(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for RoleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSetting { .. } => None,
            Self::Store(source) => Some(source),
            Self::Dispatch(source) => Some(source),
            Self::Coordinator(source) => Some(source),
        }
    }
}

impl From<StoreError> for RoleError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<DispatchError> for RoleError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<CoordinatorError> for RoleError {
    fn from(value: CoordinatorError) -> Self {
        Self::Coordinator(value)
    }
}

/// A built role, ready for `start_all`.
#[derive(Debug)]
pub enum RoleRuntime {
    Imm(ImmBackend),
    Rds(RdsEmulator),
}

impl RoleRuntime {
    pub fn role(&self) -> Role {
        match self {
            Self::Imm(_) => Role::Imm,
            Self::Rds(_) => Role::Rds,
        }
    }

    pub fn coordinator(&self) -> &ThreadCoordinator {
        match self {
            Self::Imm(backend) => backend.coordinator(),
            Self::Rds(emulator) => emulator.coordinator(),
        }
    }
}

/// Builds the role named by `process.role` on top of an in-memory store.
pub fn build(config: &AppConfig, ctx: TransportContext) -> Result<RoleRuntime, RoleError> {
    let role = Role::from_config_value(&config.process.role).ok_or_else(|| RoleError::InvalidSetting {
        key: "process.role",
        value: config.process.role.clone(),
    })?;
    let store: Arc<dyn ImageStore> = Arc::new(InMemoryImageStore::new());

    match role {
        Role::Imm => ImmBackend::build(&config.imm, ctx, store).map(RoleRuntime::Imm),
        Role::Rds => RdsEmulator::build(&config.rds, ctx, store).map(RoleRuntime::Rds),
    }
}

/// Handler errors travel back to the peer as plain messages.
pub(crate) fn reject(error: impl fmt::Display) -> String {
    error.to_string()
}
