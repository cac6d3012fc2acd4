//! Settings read from the environment (and a `.env` file, when present).
//!
//! | Variable | |
//! |---|---|
//! | `AZURE_TENANT_ID`, `AZURE_SUBSCRIPTION_ID` | required |
//! | `RESOURCE_URI` | resource the artifact runs against, required |
//! | `ARTIFACT_TITLE` | required; `ARTIFACT_FOLDER` optional |
//! | `KEYVAULT_NAME`, `KEYVAULT_RESOURCE_GROUP` | required; `KEYVAULT_URI` optional |
//! | `AZURE_ACCESS_TOKEN` | use this bearer token as is |
//! | `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET` | service principal |
//! | `IDENTITY_ENDPOINT`, `IDENTITY_HEADER` | App Service managed identity |
//! | `ARM_ENDPOINT` | management endpoint for non-public clouds |
//!
//! Without any credential variables the instance metadata endpoint is used.

use crate::{Credential, GrantError, ManagementClient, ResourceContext, VaultContext};
use log::debug;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Settings {
    pub context: ResourceContext,
    pub vault: VaultContext,
    pub credential: Credential,
    pub management_endpoint: Option<String>,
}

impl Settings {
    /// Loads `.env` if there is one, then reads the process environment.
    pub fn from_env() -> Result<Self, GrantError> {
        load_dotenv(None);
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, GrantError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| GrantError::ConfigurationError(key.to_owned()));

        let tenant_id = require("AZURE_TENANT_ID")?;
        let context = ResourceContext::new(
            tenant_id,
            require("AZURE_SUBSCRIPTION_ID")?,
            require("RESOURCE_URI")?,
            require("ARTIFACT_TITLE")?,
            get("ARTIFACT_FOLDER").unwrap_or_default(),
        );
        let vault = VaultContext::new(
            require("KEYVAULT_NAME")?,
            get("KEYVAULT_URI").unwrap_or_default(),
            require("KEYVAULT_RESOURCE_GROUP")?,
        );

        let credential = if let Some(token) = get("AZURE_ACCESS_TOKEN") {
            Credential::Static(token.to_owned())
        } else if let (Some(client_id), Some(client_secret)) = (get("AZURE_CLIENT_ID"), get("AZURE_CLIENT_SECRET")) {
            Credential::ServicePrincipal {
                client_id: client_id.to_owned(),
                client_secret: client_secret.to_owned(),
                tenant_id: tenant_id.to_owned(),
            }
        } else {
            Credential::ManagedIdentity {
                endpoint: get("IDENTITY_ENDPOINT").map(|v| v.to_owned()),
                header: get("IDENTITY_HEADER").map(|v| v.to_owned()),
            }
        };

        Ok(Self {
            context,
            vault,
            credential,
            management_endpoint: get("ARM_ENDPOINT").map(|v| v.to_owned()),
        })
    }

    pub fn client(&self) -> ManagementClient {
        match &self.management_endpoint {
            Some(endpoint) => ManagementClient::new_with_endpoint(self.credential.clone(), endpoint),
            None => ManagementClient::new(self.credential.clone()),
        }
    }
}

/// Loads `path`, or the nearest `.env` when `None`. Variables already set in
/// the environment win. A missing or malformed file is logged and skipped.
pub fn load_dotenv(path: Option<&Path>) -> bool {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    match loaded {
        Ok(()) => true,
        Err(e) => {
            debug!("No .env file loaded: {}", e);
            false
        }
    }
}
