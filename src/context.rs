use crate::GrantError;
use getset::Getters;

const RESOURCE_GROUPS_MARKER: &str = "resourcegroups/";

/// Where the artifact is being applied: the subscription, the resource the
/// extension runs against and the artifact to look for.
///
/// `lab_name` and `lab_resource_group` are filled in once by
/// `IdentityGrantOrchestrator::initialize`.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct ResourceContext {
    tenant_id: String,
    subscription_id: String,
    resource_uri: String,
    lab_name: Option<String>,
    lab_resource_group: Option<String>,
    artifact_title: String,
    artifact_folder: String,
}

impl ResourceContext {
    pub fn new(
        tenant_id: &str,
        subscription_id: &str,
        resource_uri: &str,
        artifact_title: &str,
        artifact_folder: &str,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            subscription_id: subscription_id.to_owned(),
            resource_uri: resource_uri.to_owned(),
            lab_name: None,
            lab_resource_group: None,
            artifact_title: artifact_title.to_owned(),
            artifact_folder: artifact_folder.to_owned(),
        }
    }

    pub(crate) fn set_lab(&mut self, lab_resource_group: String, lab_name: Option<String>) {
        self.lab_resource_group = Some(lab_resource_group);
        self.lab_name = lab_name;
    }
}

/// The Key Vault the identity is granted access to.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct VaultContext {
    vault_name: String,
    vault_uri: String,
    vault_resource_group: String,
}

impl VaultContext {
    /// Creates a new `VaultContext`. An empty `vault_uri` defaults to the
    /// public cloud data-plane URI of the vault.
    pub fn new(vault_name: &str, vault_uri: &str, vault_resource_group: &str) -> Self {
        let vault_uri = if vault_uri.is_empty() {
            format!("https://{}.vault.azure.net/", vault_name)
        } else {
            vault_uri.to_owned()
        };
        Self {
            vault_name: vault_name.to_owned(),
            vault_uri,
            vault_resource_group: vault_resource_group.to_owned(),
        }
    }
}

/// Returns the resource group segment of an ARM resource id, i.e. whatever
/// follows `resourceGroups/` up to the next `/`.
///
/// # Examples
///
/// ```
/// use devtestlab_msi_grant::parse_lab_resource_group;
/// let rg = parse_lab_resource_group("/subscriptions/s/resourceGroups/lab-vms/providers/x").unwrap();
/// assert_eq!(rg, "lab-vms");
/// ```
pub fn parse_lab_resource_group(resource_id: &str) -> Result<String, GrantError> {
    resource_group_segment(resource_id)
        .map(|rg| rg.to_owned())
        .ok_or_else(|| GrantError::InvalidResourceId(resource_id.to_owned()))
}

pub(crate) fn resource_group_segment(resource_id: &str) -> Option<&str> {
    // ARM ids are not consistent about the casing of the segment name.
    let first = resource_id.to_ascii_lowercase().find(RESOURCE_GROUPS_MARKER)? + RESOURCE_GROUPS_MARKER.len();
    let rest = &resource_id[first..];
    let rg = rest.split('/').next().unwrap_or_default();
    if rg.is_empty() {
        None
    } else {
        Some(rg)
    }
}
