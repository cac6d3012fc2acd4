//! DevTest Lab lookups: which lab owns a resource group, and which of its
//! virtual machines are installing a given artifact.

use crate::context::resource_group_segment;
use crate::{GrantError, ManagementClient};
use getset::Getters;
use serde::Deserialize;

const API_VERSION: &str = "2018-10-15-preview";
const INSTALLING: &str = "Installing";

#[derive(Deserialize, Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct Lab {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    properties: LabProperties,
}

#[derive(Deserialize, Debug, Clone, Default, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct LabProperties {
    /// Resource group the lab creates its virtual machines in.
    vm_creation_resource_group_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct LabVirtualMachine {
    #[serde(default)]
    name: String,
    #[serde(default)]
    properties: LabVirtualMachineProperties,
}

#[derive(Deserialize, Debug, Clone, Default, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct LabVirtualMachineProperties {
    /// Resource id of the backing `Microsoft.Compute` virtual machine.
    compute_id: Option<String>,
    #[serde(default)]
    artifacts: Vec<ArtifactInstallProperties>,
}

#[derive(Deserialize, Debug, Clone, Default, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInstallProperties {
    artifact_id: Option<String>,
    artifact_title: Option<String>,
    status: Option<String>,
}

impl ArtifactInstallProperties {
    fn is_installing(&self, artifact_title: &str) -> bool {
        self.artifact_title.as_deref() == Some(artifact_title) && self.status.as_deref() == Some(INSTALLING)
    }
}

/// Returns the name of the first lab whose VM creation resource group is
/// `resource_group`. Resource group names compare case-insensitively.
pub fn find_lab_name(labs: &[Lab], resource_group: &str) -> Option<String> {
    labs.iter()
        .filter(|lab| !lab.name.is_empty())
        .find(|lab| {
            lab.properties
                .vm_creation_resource_group_id
                .as_deref()
                .and_then(resource_group_segment)
                .map_or(false, |rg| rg.eq_ignore_ascii_case(resource_group))
        })
        .map(|lab| lab.name.clone())
}

/// Compute ids of the virtual machines currently installing `artifact_title`.
pub fn select_installing_vms(vms: &[LabVirtualMachine], artifact_title: &str) -> Vec<String> {
    vms.iter()
        .filter(|vm| vm.properties.artifacts.iter().any(|a| a.is_installing(artifact_title)))
        .filter_map(|vm| vm.properties.compute_id.clone())
        .filter(|id| !id.trim().is_empty())
        .collect()
}

impl ManagementClient {
    /// Lists every DevTest Lab in the subscription.
    pub async fn list_labs(&mut self, subscription_id: &str) -> Result<Vec<Lab>, GrantError> {
        let uri = self.url(
            &format!("/subscriptions/{}/providers/Microsoft.DevTestLab/labs", subscription_id),
            &[("api-version", API_VERSION)],
        )?;
        self.list_authed(uri).await
    }

    /// Lists the virtual machines of a lab with their artifact install status.
    pub async fn list_lab_virtual_machines(
        &mut self,
        subscription_id: &str,
        resource_group: &str,
        lab_name: &str,
    ) -> Result<Vec<LabVirtualMachine>, GrantError> {
        let uri = self.url(
            &format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.DevTestLab/labs/{}/virtualmachines",
                subscription_id, resource_group, lab_name
            ),
            &[("$expand", "properties($expand=artifacts)"), ("api-version", API_VERSION)],
        )?;
        self.list_authed(uri).await
    }
}
