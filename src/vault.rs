use crate::{GrantError, ManagementClient};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const API_VERSION: &str = "2019-09-01";

#[derive(Deserialize, Debug, Clone)]
pub struct Vault {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub properties: VaultProperties,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VaultProperties {
    pub tenant_id: String,
    #[serde(default)]
    pub access_policies: Vec<AccessPolicyEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicyEntry {
    pub tenant_id: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    pub permissions: Permissions,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<String>,
}

impl Vault {
    /// Access policies granted to `object_id`.
    pub fn policies_for(&self, object_id: &str) -> Vec<AccessPolicyEntry> {
        self.properties
            .access_policies
            .iter()
            .filter(|p| p.object_id.eq_ignore_ascii_case(object_id))
            .cloned()
            .collect()
    }

    /// Policy allowing `object_id` to read secrets, in the vault's tenant.
    pub fn secret_reader_policy(&self, object_id: &str) -> AccessPolicyEntry {
        AccessPolicyEntry {
            tenant_id: self.properties.tenant_id.clone(),
            object_id: object_id.to_owned(),
            application_id: None,
            permissions: Permissions {
                secrets: vec!["get".to_owned()],
                ..Permissions::default()
            },
        }
    }
}

impl ManagementClient {
    /// Gets a Key Vault's management-plane resource.
    pub async fn get_vault(
        &mut self,
        subscription_id: &str,
        resource_group: &str,
        vault_name: &str,
    ) -> Result<Vault, GrantError> {
        let path = vault_path(subscription_id, resource_group, vault_name);
        let uri = self.url(&path, &[("api-version", API_VERSION)])?;
        let mut vault: Vault = self.get_authed(uri).await?;
        if vault.id.is_empty() {
            vault.id = path;
        }
        Ok(vault)
    }

    /// Adds a policy letting `object_id` get secrets from the vault.
    pub async fn add_secret_reader(&mut self, vault: &Vault, object_id: &str) -> Result<(), GrantError> {
        let policy = vault.secret_reader_policy(object_id);
        self.update_access_policies(&vault.id, "add", &[policy]).await
    }

    /// Removes every policy the vault holds for `object_id`. The vault is
    /// read again so permissions granted since `vault` was fetched go too.
    pub async fn remove_access_policy(&mut self, vault: &Vault, object_id: &str) -> Result<(), GrantError> {
        let uri = self.url(&vault.id, &[("api-version", API_VERSION)])?;
        let current: Vault = self.get_authed(uri).await?;
        let policies = current.policies_for(object_id);
        if policies.is_empty() {
            debug!("Vault {} has no policy for {}", vault.name, object_id);
            return Ok(());
        }
        self.update_access_policies(&vault.id, "remove", &policies).await
    }

    async fn update_access_policies(
        &mut self,
        vault_id: &str,
        operation: &str,
        policies: &[AccessPolicyEntry],
    ) -> Result<(), GrantError> {
        let uri = self.url(
            &format!("{}/accessPolicies/{}", vault_id, operation),
            &[("api-version", API_VERSION)],
        )?;
        let body = json!({ "properties": { "accessPolicies": policies } });
        self.put_authed::<Value, _>(uri, &body).await?;
        Ok(())
    }
}

fn vault_path(subscription_id: &str, resource_group: &str, vault_name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.KeyVault/vaults/{}",
        subscription_id, resource_group, vault_name
    )
}
