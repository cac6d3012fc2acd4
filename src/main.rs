use devtestlab_msi_grant::config::Settings;
use devtestlab_msi_grant::IdentityGrantOrchestrator;
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("[EnableVmMSI] {}", e);
            return Err(e.into());
        }
    };
    let Settings { mut context, vault, .. } = settings.clone();

    let mut orchestrator = IdentityGrantOrchestrator::new(settings.client());
    let outcomes = orchestrator.run(&mut context, &vault).await;

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    info!(
        "[EnableVmMSI] Processed {} virtual machine(s), {} failed",
        outcomes.len(),
        failed
    );
    Ok(())
}
