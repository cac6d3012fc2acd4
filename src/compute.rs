use crate::{GrantError, ManagementClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const API_VERSION: &str = "2019-07-01";
const SYSTEM_ASSIGNED: &str = "SystemAssigned";
const USER_ASSIGNED: &str = "UserAssigned";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct VirtualMachine {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub identity: Option<VirtualMachineIdentity>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIdentity {
    #[serde(rename = "type", default)]
    pub identity_type: String,
    pub principal_id: Option<String>,
    pub tenant_id: Option<String>,
    pub user_assigned_identities: Option<Map<String, Value>>,
}

impl VirtualMachineIdentity {
    fn has(&self, kind: &str) -> bool {
        self.identity_type
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(kind))
    }
}

impl VirtualMachine {
    /// Whether the system-assigned identity is on and has a principal.
    pub fn is_identity_enabled(&self) -> bool {
        self.principal_id().is_some()
    }

    /// The principal id of the system-assigned identity, if it is enabled.
    pub fn principal_id(&self) -> Option<&str> {
        self.identity
            .as_ref()
            .filter(|identity| identity.has(SYSTEM_ASSIGNED))
            .and_then(|identity| identity.principal_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn user_assigned(&self) -> Option<&Map<String, Value>> {
        self.identity
            .as_ref()
            .filter(|identity| identity.has(USER_ASSIGNED))
            .and_then(|identity| identity.user_assigned_identities.as_ref())
    }

    /// Identity block turning the system-assigned identity on or off while
    /// keeping any user-assigned identities attached.
    pub(crate) fn identity_patch(&self, system_assigned: bool) -> Value {
        let user_assigned = self.user_assigned().filter(|m| !m.is_empty());
        let identity_type = match (system_assigned, user_assigned.is_some()) {
            (true, true) => "SystemAssigned, UserAssigned",
            (true, false) => SYSTEM_ASSIGNED,
            (false, true) => USER_ASSIGNED,
            (false, false) => "None",
        };
        let mut identity = json!({ "type": identity_type });
        if let Some(user_assigned) = user_assigned {
            // Only the keys are accepted on update; the values are read-only.
            let ids: Map<String, Value> = user_assigned.keys().map(|k| (k.clone(), json!({}))).collect();
            identity["userAssignedIdentities"] = Value::Object(ids);
        }
        json!({ "identity": identity })
    }
}

impl ManagementClient {
    /// Gets a virtual machine by its full resource id.
    pub async fn get_virtual_machine(&mut self, compute_id: &str) -> Result<VirtualMachine, GrantError> {
        let uri = self.url(compute_id, &[("api-version", API_VERSION)])?;
        let mut vm: VirtualMachine = self.get_authed(uri).await?;
        if vm.id.is_empty() {
            vm.id = compute_id.to_owned();
        }
        Ok(vm)
    }

    /// Requests the system-assigned identity. The update completes
    /// asynchronously; the returned model may not carry the principal yet.
    pub async fn enable_system_identity(
        &mut self,
        vm: &VirtualMachine,
    ) -> Result<Option<VirtualMachine>, GrantError> {
        let uri = self.url(&vm.id, &[("api-version", API_VERSION)])?;
        let updated: Option<VirtualMachine> = self.patch_authed(uri, &vm.identity_patch(true)).await?;
        Ok(updated.map(|mut updated| {
            if updated.id.is_empty() {
                updated.id = vm.id.clone();
            }
            updated
        }))
    }

    /// Removes the system-assigned identity, keeping user-assigned ones.
    pub async fn disable_system_identity(
        &mut self,
        vm: &VirtualMachine,
    ) -> Result<Option<VirtualMachine>, GrantError> {
        let uri = self.url(&vm.id, &[("api-version", API_VERSION)])?;
        self.patch_authed(uri, &vm.identity_patch(false)).await
    }
}
