use crate::GrantError;
use anyhow::Context;
use azure_sdk_auth_aad::authorize_non_interactive;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use oauth2::{ClientId, ClientSecret};
use serde::Deserialize;
use std::sync::Arc;

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// How the management client obtains its bearer token.
#[derive(Debug, Clone)]
pub enum Credential {
    /// The ambient managed identity of the host. With an `endpoint` set this
    /// is the App Service / Functions identity endpoint, otherwise the VM
    /// instance metadata service.
    ManagedIdentity {
        endpoint: Option<String>,
        header: Option<String>,
    },
    /// Client credentials flow for an AAD application.
    ServicePrincipal {
        client_id: String,
        client_secret: String,
        tenant_id: String,
    },
    /// A token acquired elsewhere, used as is.
    Static(String),
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub(crate) secret: String,
    pub(crate) expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_on
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self.expires_on {
            Some(exp) => exp > Utc::now(),
            None => true,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ManagedIdentityTokenResponse {
    access_token: String,
    // Both endpoints send the epoch seconds as a string.
    expires_on: Option<String>,
}

impl Credential {
    /// Managed identity, picking up `IDENTITY_ENDPOINT` and `IDENTITY_HEADER`
    /// when the host (App Service, Functions) provides them.
    pub fn managed_identity_from_env() -> Self {
        Credential::ManagedIdentity {
            endpoint: std::env::var("IDENTITY_ENDPOINT").ok(),
            header: std::env::var("IDENTITY_HEADER").ok(),
        }
    }

    pub(crate) async fn get_token(&self, resource: &str) -> Result<AccessToken, GrantError> {
        match self {
            Credential::Static(token) => Ok(AccessToken {
                secret: token.clone(),
                expires_on: None,
            }),
            Credential::ServicePrincipal {
                client_id,
                client_secret,
                tenant_id,
            } => {
                let aad_client_id = ClientId::new(client_id.to_owned());
                let aad_client_secret = ClientSecret::new(client_secret.to_owned());
                let token = authorize_non_interactive(
                    Arc::new(reqwest::Client::new()),
                    &aad_client_id,
                    &aad_client_secret,
                    resource,
                    tenant_id,
                )
                .await
                .with_context(|| "Failed to authenticate to Azure Active Directory")
                .map_err(GrantError::AuthorizationError)?;
                Ok(AccessToken {
                    secret: token.access_token().secret().to_owned(),
                    expires_on: Some(token.expires_on),
                })
            }
            Credential::ManagedIdentity { endpoint, header } => {
                managed_identity_token(endpoint.as_deref(), header.as_deref(), resource).await
            }
        }
    }
}

async fn managed_identity_token(
    endpoint: Option<&str>,
    header: Option<&str>,
    resource: &str,
) -> Result<AccessToken, GrantError> {
    let request = match endpoint {
        Some(endpoint) => {
            debug!("Requesting managed identity token from {}", endpoint);
            reqwest::Client::new()
                .get(endpoint)
                .query(&[("resource", resource), ("api-version", APP_SERVICE_API_VERSION)])
                .header("X-IDENTITY-HEADER", header.unwrap_or_default())
        }
        None => {
            debug!("Requesting managed identity token from instance metadata");
            reqwest::Client::new()
                .get(IMDS_ENDPOINT)
                .query(&[("resource", resource), ("api-version", IMDS_API_VERSION)])
                .header("Metadata", "true")
        }
    };

    let resp = request
        .send()
        .await
        .with_context(|| "Failed to reach the managed identity endpoint")
        .map_err(GrantError::AuthorizationError)?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .with_context(|| "Failed to read the managed identity response")
        .map_err(GrantError::AuthorizationError)?;
    if !status.is_success() {
        return Err(GrantError::AuthorizationError(anyhow::anyhow!(
            "Managed identity endpoint returned {}: {}",
            status,
            body
        )));
    }

    let response = serde_json::from_str::<ManagedIdentityTokenResponse>(&body)
        .with_context(|| "Failed to parse the managed identity response")
        .map_err(GrantError::AuthorizationError)?;
    let expires_on = response
        .expires_on
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Ok(AccessToken {
        secret: response.access_token,
        expires_on,
    })
}
