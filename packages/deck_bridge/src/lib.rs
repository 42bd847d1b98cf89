// Library interface for deck_bridge
// Lets several editor-window processes share one control deck through a
// leader elected by ownership of a loopback port.

pub mod commands;
pub mod config;
pub mod election;
pub mod error;
pub mod follower;
pub mod leader;
pub mod protocol;
pub mod registry;
pub mod token;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{BridgeConfig, FileConfig, ProviderConfig, ProvidersConfig};
pub use election::{ElectionCoordinator, RoleKind, generate_window_id};
pub use error::{BridgeError, CommandError};
pub use follower::FollowerClient;
pub use leader::LeaderServer;
pub use protocol::{CancelResult, RunResult, Slot, SlotStatus, TaskResult};
pub use registry::{
    Cleanup, ProviderNotifiers, ProviderRegistration, ProviderRegistry, RegistrationHandle,
    SlotProvider,
};
pub use token::TokenManager;
