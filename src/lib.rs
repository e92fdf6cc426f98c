//! DigitalRebar Provision provider plugin.
//!
//! The plugin exposes three resources to an infrastructure-as-code host:
//!
//! - **`drp_pool`**: a machine pool with transition actions and autofill
//! - **`drp_profile_param`**: a parameter on a profile, optionally sealed
//!   with the profile's public key before it leaves the provider
//! - **`drp_instance`**: a machine allocated from a pool, powered on and
//!   polled until its deploy workflow completes
//!
//! # Handshake Protocol
//!
//! When started via [`serve`], the plugin binds a local port and prints one
//! line to stdout:
//!
//! ```text
//! PROVIDER_PLUGIN|1|127.0.0.1:50051
//! ```
//!
//! Format: `PROVIDER_PLUGIN|<protocol_version>|<address>`. The host then
//! connects over gRPC (`proto/provider.proto`). Logs go to stderr.
//!
//! # Provider Protocol
//!
//! - **GetMetadata**, **GetSchema**: resource names and schemas
//! - **ValidateProviderConfig**, **Configure**: DRP endpoint and credentials
//! - **ValidateResourceConfig**, **UpgradeResourceState**, **Plan**
//! - **Create/Read/Update/Delete**, **ImportResourceState**
//! - **Stop**
//!
//! # Embedding
//!
//! ```ignore
//! use terraform_provider_drp::{provider::DrpProvider, serve};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     terraform_provider_drp::init_logging();
//!     serve(DrpProvider::new()).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod plan;
pub mod poller;
pub mod provider;
pub mod resources;
pub mod schema;
pub mod secure;
pub mod server;
pub mod status;
pub mod testing;
pub mod types;
pub mod validation;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod protocol;

pub use client::{DrpApi, DrpClient};
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use poller::{wait_for_state, Backoff, Observation, PollConfig, PollError, PollState};
pub use provider::DrpProvider;
pub use schema::ProviderSchema;
pub use server::{serve, ProviderService, ServeOptions};
pub use status::MachineStatus;
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX,
    PROTOCOL_VERSION,
};
pub use validation::validate;
