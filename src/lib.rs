//! Grants a DevTest Lab virtual machine's system-assigned managed identity
//! temporary read access to the secrets of an Azure Key Vault.
//!
//! The flow is driven by [`IdentityGrantOrchestrator`]: it resolves the lab
//! that owns a resource group, finds the VMs currently installing a named
//! artifact, enables their identity, adds a `get` secret policy on the vault,
//! holds it for a fixed window and then revokes everything again.
//!
//! # Examples
//!
//! ```no_run
//! use devtestlab_msi_grant::{
//!     Credential, IdentityGrantOrchestrator, ManagementClient, ResourceContext, VaultContext,
//! };
//!
//! # async fn run() {
//! let mut context = ResourceContext::new(
//!     "bc598e67-03d8-44d5-aa46-8289b9a39a14",
//!     "c1a6d79b-082b-4798-b362-a77e96de50db",
//!     "/subscriptions/c1a6d79b-082b-4798-b362-a77e96de50db/resourceGroups/lab-vms/providers/Microsoft.Compute/virtualMachines/vm1",
//!     "Install build agent",
//!     "",
//! );
//! let vault = VaultContext::new("test-keyvault", "", "shared-rg");
//!
//! let client = ManagementClient::new(Credential::managed_identity_from_env());
//! let mut orchestrator = IdentityGrantOrchestrator::new(client);
//! let outcomes = orchestrator.run(&mut context, &vault).await;
//! # }
//! ```

use thiserror::Error;

mod client;
mod compute;
pub mod config;
mod context;
mod credential;
pub mod lab;
mod orchestrator;
mod vault;

pub use client::ManagementClient;
pub use compute::{VirtualMachine, VirtualMachineIdentity};
pub use context::{parse_lab_resource_group, ResourceContext, VaultContext};
pub use credential::{AccessToken, Credential};
pub use orchestrator::{GrantSchedule, IdentityGrantOrchestrator, VmGrantOutcome};
pub use vault::{AccessPolicyEntry, Permissions, Vault};

#[derive(Error, Debug)]
pub enum GrantError {
    #[error("Failed to authorize: {0:?}")]
    AuthorizationError(anyhow::Error),
    #[error("Request to {uri} failed: {source}")]
    HttpError {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Request to {uri} returned {status}: {body}")]
    UnexpectedStatus {
        uri: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("Failed to parse response from {uri}: {source}")]
    ParseError {
        uri: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Resource id {0} does not contain a resource group")]
    InvalidResourceId(String),
    #[error("Missing configuration: {0}")]
    ConfigurationError(String),
    #[error("Virtual machine {0} has no system-assigned identity principal")]
    MissingPrincipal(String),
}
