use crate::compute::VirtualMachine;
use crate::context::parse_lab_resource_group;
use crate::lab::{find_lab_name, select_installing_vms};
use crate::{GrantError, ManagementClient, ResourceContext, Vault, VaultContext};
use chrono::Utc;
use getset::Getters;
use log::{info, warn};
use std::time::Duration;
use tokio::time::delay_for;

/// Timing of one grant: the identity poll and how long access is held.
#[derive(Debug, Clone, Copy)]
pub struct GrantSchedule {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub hold: Duration,
}

impl Default for GrantSchedule {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_polls: 20,
            hold: Duration::from_secs(20 * 60),
        }
    }
}

/// Result of processing one virtual machine.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct VmGrantOutcome {
    compute_id: String,
    principal_id: Option<String>,
    error: Option<GrantError>,
}

impl VmGrantOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// How far one VM's grant got, so the cleanup knows what to undo.
#[derive(Debug, Default)]
struct GrantProgress {
    vm: Option<VirtualMachine>,
    enable_requested: bool,
    principal_id: Option<String>,
    vault: Option<Vault>,
    held: bool,
}

/// Enables a lab VM's managed identity, lets it read the vault's secrets for
/// a while, then takes both away again.
///
/// # Examples
///
/// ```
/// use devtestlab_msi_grant::{Credential, IdentityGrantOrchestrator, ManagementClient};
/// let orchestrator = IdentityGrantOrchestrator::new(ManagementClient::new(Credential::Static("{token}".to_owned())));
/// ```
#[derive(Debug)]
pub struct IdentityGrantOrchestrator {
    client: ManagementClient,
    schedule: GrantSchedule,
}

impl IdentityGrantOrchestrator {
    pub fn new(client: ManagementClient) -> Self {
        Self::with_schedule(client, GrantSchedule::default())
    }

    pub fn with_schedule(client: ManagementClient, schedule: GrantSchedule) -> Self {
        Self { client, schedule }
    }

    /// Initializes and grants, logging instead of failing. Returns one outcome
    /// per virtual machine processed; empty when there was nothing to do.
    pub async fn run(&mut self, context: &mut ResourceContext, vault: &VaultContext) -> Vec<VmGrantOutcome> {
        if let Err(e) = self.initialize(context).await {
            warn!("[EnableVmMSI] Initialization failed: {}", e);
            return Vec::new();
        }
        match self.grant_and_revoke(context, vault).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("[EnableVmMSI] Failed to find virtual machines: {}", e);
                Vec::new()
            }
        }
    }

    /// Acquires the management token and fills in the lab resource group and
    /// lab name of `context`. A failed lab lookup is logged and leaves the
    /// lab name empty.
    pub async fn initialize(&mut self, context: &mut ResourceContext) -> Result<(), GrantError> {
        self.client.refresh_token().await?;

        let lab_resource_group = parse_lab_resource_group(context.resource_uri())?;
        info!("[EnableVmMSI] Getting lab name for resource group {}", lab_resource_group);
        let lab_name = match self.client.list_labs(context.subscription_id()).await {
            Ok(labs) => find_lab_name(&labs, &lab_resource_group),
            Err(e) => {
                warn!("[EnableVmMSI] Failed to list labs: {}", e);
                None
            }
        };
        match &lab_name {
            Some(name) => info!("[EnableVmMSI] Found lab {}", name),
            None => info!("[EnableVmMSI] No lab creates VMs in {}", lab_resource_group),
        }

        context.set_lab(lab_resource_group, lab_name);
        Ok(())
    }

    /// Grants every VM installing the configured artifact access to `vault`
    /// for the hold duration, one VM at a time. Failures are recorded per VM.
    pub async fn grant_and_revoke(
        &mut self,
        context: &ResourceContext,
        vault: &VaultContext,
    ) -> Result<Vec<VmGrantOutcome>, GrantError> {
        let (lab_resource_group, lab_name) = match (context.lab_resource_group(), context.lab_name()) {
            (Some(rg), Some(name)) => (rg, name),
            _ => {
                info!("[EnableVmMSI] No lab resolved, nothing to do");
                return Ok(Vec::new());
            }
        };

        let vms = self
            .client
            .list_lab_virtual_machines(context.subscription_id(), lab_resource_group, lab_name)
            .await?;
        let compute_ids = select_installing_vms(&vms, context.artifact_title());
        info!(
            "[EnableVmMSI] Found VMs installing {}: {}",
            context.artifact_title(),
            compute_ids.join(",")
        );

        let mut outcomes = Vec::with_capacity(compute_ids.len());
        for compute_id in compute_ids {
            info!("[EnableVmMSI] Found VM {} with the artifact being applied", compute_id);
            let mut progress = GrantProgress::default();
            let error = self.grant_vm(context, vault, &compute_id, &mut progress).await.err();
            if let Some(e) = &error {
                warn!("[EnableVmMSI][Error] {}: {}", compute_id, e);
            }
            self.revoke(&progress).await;
            outcomes.push(VmGrantOutcome {
                compute_id,
                principal_id: progress.principal_id,
                error,
            });
        }
        Ok(outcomes)
    }

    async fn grant_vm(
        &mut self,
        context: &ResourceContext,
        vault: &VaultContext,
        compute_id: &str,
        progress: &mut GrantProgress,
    ) -> Result<(), GrantError> {
        let vm = self.client.get_virtual_machine(compute_id).await?;
        self.enable_managed_identity(vm, progress).await?;
        let principal = progress
            .vm
            .as_ref()
            .and_then(|vm| vm.principal_id())
            .map(|p| p.to_owned())
            .ok_or_else(|| GrantError::MissingPrincipal(compute_id.to_owned()))?;
        progress.principal_id = Some(principal.clone());

        let key_vault = self
            .client
            .get_vault(context.subscription_id(), vault.vault_resource_group(), vault.vault_name())
            .await?;
        info!("[EnableVmMSI] Add vault policy started: {}", Utc::now());
        // The policy may land even when the response fails, so revoke it regardless.
        let added = self.client.add_secret_reader(&key_vault, &principal).await;
        progress.vault = Some(key_vault);
        added?;
        info!("[EnableVmMSI] Add vault policy completed: {}", Utc::now());

        info!("[EnableVmMSI] Waiting {:?} until removing MSI", self.schedule.hold);
        delay_for(self.schedule.hold).await;
        progress.held = true;
        Ok(())
    }

    /// Takes back whatever `grant_vm` got to: the vault policy if one may have
    /// been added, and the identity if this run turned it on or the hold ran.
    async fn revoke(&mut self, progress: &GrantProgress) {
        if let (Some(key_vault), Some(principal)) = (&progress.vault, &progress.principal_id) {
            info!("[EnableVmMSI] Remove vault policy starting: {}", Utc::now());
            match self.client.remove_access_policy(key_vault, principal).await {
                Ok(()) => info!("[EnableVmMSI] Remove vault policy ending: {}", Utc::now()),
                Err(e) => warn!("[EnableVmMSI] Remove vault policy error: {}", e),
            }
        }

        let vm = match &progress.vm {
            Some(vm) if progress.enable_requested || progress.held => vm,
            _ => return,
        };
        info!("[EnableVmMSI] Disable MSI starting: {}", Utc::now());
        match self.client.disable_system_identity(vm).await {
            Ok(_) => info!("[EnableVmMSI] Disable MSI finished: {}", Utc::now()),
            Err(e) => warn!("[EnableVmMSI] Disable MSI error: {}", e),
        }
    }

    /// Turns on the system-assigned identity unless it already is, then polls
    /// until the principal id shows up or the poll budget runs out. The latest
    /// view of the VM is kept in `progress` even when a poll fails.
    async fn enable_managed_identity(
        &mut self,
        vm: VirtualMachine,
        progress: &mut GrantProgress,
    ) -> Result<(), GrantError> {
        info!(
            "[EnableVmMSI] Enable MSI start: vm={}, enabled?={}",
            vm.name,
            vm.is_identity_enabled()
        );
        if vm.is_identity_enabled() {
            progress.vm = Some(vm);
            return Ok(());
        }

        progress.enable_requested = true;
        progress.vm = Some(vm.clone());
        // The update is a long-running operation; only its acceptance is awaited.
        let mut vm = match self.client.enable_system_identity(&vm).await? {
            Some(updated) if updated.is_identity_enabled() => updated,
            _ => vm,
        };

        let mut counter = 0;
        if !vm.is_identity_enabled() {
            delay_for(self.schedule.poll_interval).await;
        }
        while counter < self.schedule.max_polls && !vm.is_identity_enabled() {
            counter += 1;
            delay_for(self.schedule.poll_interval).await;
            info!("[EnableVmMSI] Enable MSI loop: counter={}", counter);
            vm = self.client.get_virtual_machine(&vm.id).await?;
        }

        info!(
            "[EnableVmMSI] Enable MSI end: vm={}, enabled?={}",
            vm.name,
            vm.is_identity_enabled()
        );
        progress.vm = Some(vm);
        Ok(())
    }
}
