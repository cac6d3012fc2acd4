use devtestlab_msi_grant::{
    Credential, GrantError, GrantSchedule, IdentityGrantOrchestrator, ManagementClient, ResourceContext, VaultContext,
};
use mockito::{mock, Matcher, Mock};
use serde_json::json;
use std::time::Duration;

const LAB_API: &str = "2018-10-15-preview";

fn client() -> ManagementClient {
    ManagementClient::new_with_endpoint(Credential::Static("test-token".to_owned()), &mockito::server_url())
}

fn quick() -> GrantSchedule {
    GrantSchedule {
        poll_interval: Duration::from_millis(1),
        max_polls: 3,
        hold: Duration::from_millis(1),
    }
}

fn vm_id(sub: &str, name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/lab-vms/providers/Microsoft.Compute/virtualMachines/{}",
        sub, name
    )
}

fn vault_id(sub: &str) -> String {
    format!("/subscriptions/{}/resourceGroups/shared/providers/Microsoft.KeyVault/vaults/kv", sub)
}

fn context(sub: &str) -> ResourceContext {
    ResourceContext::new("t1", sub, &vm_id(sub, "vm1"), "Grant Vault", "")
}

fn vault() -> VaultContext {
    VaultContext::new("kv", "", "shared")
}

fn json_mock(method: &str, path: &str, body: serde_json::Value) -> Mock {
    mock(method, path)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
}

fn labs_mock(sub: &str) -> Mock {
    json_mock(
        "GET",
        &format!("/subscriptions/{}/providers/Microsoft.DevTestLab/labs", sub),
        json!({ "value": [
            { "name": "other-lab", "properties": { "vmCreationResourceGroupId": format!("/subscriptions/{}/resourceGroups/other-vms", sub) } },
            { "name": "build-lab", "properties": { "vmCreationResourceGroupId": format!("/subscriptions/{}/resourceGroups/lab-vms", sub) } }
        ] }),
    )
    .match_header("authorization", "Bearer test-token")
    .create()
}

fn lab_vms_mock(sub: &str, installing: &[&str]) -> Mock {
    let mut vms: Vec<_> = installing
        .iter()
        .map(|name| {
            json!({ "name": name, "properties": {
                "computeId": vm_id(sub, name),
                "artifacts": [{ "artifactTitle": "Grant Vault", "status": "Installing" }]
            } })
        })
        .collect();
    vms.push(json!({ "name": "idle", "properties": {
        "computeId": vm_id(sub, "idle"),
        "artifacts": [{ "artifactTitle": "Grant Vault", "status": "Succeeded" }]
    } }));

    mock(
        "GET",
        format!(
            "/subscriptions/{}/resourceGroups/lab-vms/providers/Microsoft.DevTestLab/labs/build-lab/virtualmachines",
            sub
        )
        .as_str(),
    )
    .match_query(Matcher::AllOf(vec![
        Matcher::UrlEncoded("$expand".into(), "properties($expand=artifacts)".into()),
        Matcher::UrlEncoded("api-version".into(), LAB_API.into()),
    ]))
    .with_status(200)
    .with_body(json!({ "value": vms }).to_string())
    .create()
}

fn vault_body(sub: &str, principal: Option<&str>) -> serde_json::Value {
    let mut policies = vec![json!({ "tenantId": "t1", "objectId": "admin", "permissions": { "secrets": ["get", "set"] } })];
    if let Some(principal) = principal {
        policies.push(json!({ "tenantId": "t1", "objectId": principal, "permissions": { "secrets": ["get"] } }));
    }
    json!({ "id": vault_id(sub), "name": "kv", "properties": { "tenantId": "t1", "accessPolicies": policies } })
}

#[tokio::test]
async fn grants_and_revokes_installing_vm() {
    let sub = "sub-full";
    let vm1 = vm_id(sub, "vm1");
    let labs = labs_mock(sub);
    let lab_vms = lab_vms_mock(sub, &["vm1"]);
    let get_vm = json_mock("GET", &vm1, json!({ "id": vm1, "name": "vm1" })).expect(1).create();
    let enable = json_mock(
        "PATCH",
        &vm1,
        json!({ "id": vm1, "name": "vm1", "identity": { "type": "SystemAssigned", "principalId": "principal-1" } }),
    )
    .match_body(Matcher::Regex(r#""type":"SystemAssigned""#.to_owned()))
    .expect(1)
    .create();
    let get_vault = json_mock("GET", &vault_id(sub), vault_body(sub, Some("principal-1")))
        .expect(2)
        .create();
    let add = json_mock("PUT", &format!("{}/accessPolicies/add", vault_id(sub)), json!({}))
        .match_body(Matcher::Regex(
            r#""objectId":"principal-1","permissions":\{"secrets":\["get"\]\}"#.to_owned(),
        ))
        .expect(1)
        .create();
    let remove = json_mock("PUT", &format!("{}/accessPolicies/remove", vault_id(sub)), json!({}))
        .match_body(Matcher::Regex(r#""objectId":"principal-1""#.to_owned()))
        .expect(1)
        .create();
    let disable = json_mock("PATCH", &vm1, json!({ "id": vm1, "name": "vm1" }))
        .match_body(Matcher::Regex(r#""type":"None""#.to_owned()))
        .expect(1)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let outcomes = orchestrator.run(&mut context, &vault()).await;

    assert_eq!(context.lab_name().as_deref(), Some("build-lab"));
    assert_eq!(context.lab_resource_group().as_deref(), Some("lab-vms"));
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_success(), "{:?}", outcomes[0].error());
    assert_eq!(outcomes[0].compute_id(), &vm1);
    assert_eq!(outcomes[0].principal_id().as_deref(), Some("principal-1"));

    labs.assert();
    lab_vms.assert();
    get_vm.assert();
    enable.assert();
    get_vault.assert();
    add.assert();
    remove.assert();
    disable.assert();
}

#[tokio::test]
async fn already_enabled_identity_is_not_updated() {
    let sub = "sub-enabled";
    let vm1 = vm_id(sub, "vm1");
    let _labs = labs_mock(sub);
    let _lab_vms = lab_vms_mock(sub, &["vm1"]);
    let get_vm = json_mock(
        "GET",
        &vm1,
        json!({ "id": vm1, "name": "vm1", "identity": { "type": "SystemAssigned", "principalId": "principal-2" } }),
    )
    .expect(1)
    .create();
    let enable = mock("PATCH", vm1.as_str())
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex(r#""type":"SystemAssigned""#.to_owned()))
        .expect(0)
        .create();
    let disable = mock("PATCH", vm1.as_str())
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex(r#""type":"None""#.to_owned()))
        .expect(0)
        .create();
    let _vault = mock("GET", vault_id(sub).as_str())
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(r#"{"error":{"code":"ResourceNotFound"}}"#)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let outcomes = orchestrator.run(&mut context, &vault()).await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].principal_id().as_deref(), Some("principal-2"));
    match outcomes[0].error() {
        Some(GrantError::UnexpectedStatus { status, .. }) => assert_eq!(status.as_u16(), 404),
        other => panic!("unexpected error {:?}", other),
    }
    get_vm.assert();
    enable.assert();
    // The identity was there before this run, so a failed grant leaves it alone.
    disable.assert();
}

#[tokio::test]
async fn gives_up_when_principal_never_appears() {
    let sub = "sub-poll";
    let vm1 = vm_id(sub, "vm1");
    let _labs = labs_mock(sub);
    let _lab_vms = lab_vms_mock(sub, &["vm1"]);
    // One initial read plus one per poll.
    let get_vm = json_mock("GET", &vm1, json!({ "id": vm1, "name": "vm1" })).expect(4).create();
    let enable = mock("PATCH", vm1.as_str())
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex(r#""type":"SystemAssigned""#.to_owned()))
        .with_status(202)
        .with_body("")
        .expect(1)
        .create();
    let disable = json_mock("PATCH", &vm1, json!({}))
        .match_body(Matcher::Regex(r#""type":"None""#.to_owned()))
        .expect(1)
        .create();
    let get_vault = mock("GET", vault_id(sub).as_str())
        .match_query(Matcher::Any)
        .expect(0)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let outcomes = orchestrator.run(&mut context, &vault()).await;

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].error(), Some(GrantError::MissingPrincipal(id)) if id == &vm1));
    assert!(outcomes[0].principal_id().is_none());
    get_vm.assert();
    enable.assert();
    disable.assert();
    get_vault.assert();
}

#[tokio::test]
async fn principal_found_while_polling_proceeds_to_grant() {
    let sub = "sub-polled";
    let vm1 = vm_id(sub, "vm1");
    // ARM answers with its own casing of the id; later calls follow the answer.
    let vm1_echo = vm_id(sub, "VM1");
    let _labs = labs_mock(sub);
    let _lab_vms = lab_vms_mock(sub, &["vm1"]);
    let first_read = json_mock("GET", &vm1, json!({ "id": vm1_echo, "name": "vm1" }))
        .expect(1)
        .create();
    let enable = mock("PATCH", vm1_echo.as_str())
        .match_query(Matcher::Any)
        .match_body(Matcher::Regex(r#""type":"SystemAssigned""#.to_owned()))
        .with_status(202)
        .with_body("")
        .expect(1)
        .create();
    let poll = json_mock(
        "GET",
        &vm1_echo,
        json!({ "id": vm1_echo, "name": "vm1", "identity": { "type": "SystemAssigned", "principalId": "principal-4" } }),
    )
    .expect(1)
    .create();
    let _vault = json_mock("GET", &vault_id(sub), vault_body(sub, Some("principal-4"))).create();
    let add = json_mock("PUT", &format!("{}/accessPolicies/add", vault_id(sub)), json!({}))
        .match_body(Matcher::Regex(r#""objectId":"principal-4""#.to_owned()))
        .expect(1)
        .create();
    let remove = json_mock("PUT", &format!("{}/accessPolicies/remove", vault_id(sub)), json!({}))
        .match_body(Matcher::Regex(r#""objectId":"principal-4""#.to_owned()))
        .expect(1)
        .create();
    let disable = json_mock("PATCH", &vm1_echo, json!({}))
        .match_body(Matcher::Regex(r#""type":"None""#.to_owned()))
        .expect(1)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let outcomes = orchestrator.run(&mut context, &vault()).await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_success(), "{:?}", outcomes[0].error());
    assert_eq!(outcomes[0].principal_id().as_deref(), Some("principal-4"));
    first_read.assert();
    enable.assert();
    // The first poll already sees the principal.
    poll.assert();
    add.assert();
    remove.assert();
    disable.assert();
}

#[tokio::test]
async fn failed_grant_still_revokes_and_disables() {
    let sub = "sub-addfail";
    let vm1 = vm_id(sub, "vm1");
    let _labs = labs_mock(sub);
    let _lab_vms = lab_vms_mock(sub, &["vm1"]);
    let _get_vm = json_mock("GET", &vm1, json!({ "id": vm1, "name": "vm1" })).create();
    let _enable = json_mock(
        "PATCH",
        &vm1,
        json!({ "id": vm1, "name": "vm1", "identity": { "type": "SystemAssigned", "principalId": "p1" } }),
    )
    .match_body(Matcher::Regex(r#""type":"SystemAssigned""#.to_owned()))
    .create();
    // The add went through on the vault even though the call failed.
    let _vault = json_mock("GET", &vault_id(sub), vault_body(sub, Some("p1"))).create();
    let add = mock("PUT", format!("{}/accessPolicies/add", vault_id(sub)).as_str())
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(1)
        .create();
    let remove = json_mock("PUT", &format!("{}/accessPolicies/remove", vault_id(sub)), json!({}))
        .match_body(Matcher::Regex(r#""objectId":"p1""#.to_owned()))
        .expect(1)
        .create();
    let disable = json_mock("PATCH", &vm1, json!({}))
        .match_body(Matcher::Regex(r#""type":"None""#.to_owned()))
        .expect(1)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let outcomes = orchestrator.run(&mut context, &vault()).await;

    assert_eq!(outcomes.len(), 1);
    match outcomes[0].error() {
        Some(GrantError::UnexpectedStatus { status, uri, .. }) => {
            assert_eq!(status.as_u16(), 500);
            assert!(uri.contains("/accessPolicies/add"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(outcomes[0].principal_id().as_deref(), Some("p1"));
    add.assert();
    remove.assert();
    disable.assert();
}

#[tokio::test]
async fn failing_vm_does_not_stop_the_others() {
    let sub = "sub-isolated";
    let broken = vm_id(sub, "broken");
    let healthy = vm_id(sub, "healthy");
    let _labs = labs_mock(sub);
    let _lab_vms = lab_vms_mock(sub, &["broken", "healthy"]);
    let _broken = mock("GET", broken.as_str())
        .match_query(Matcher::Any)
        .with_status(500)
        .create();
    let _healthy = json_mock(
        "GET",
        &healthy,
        json!({ "id": healthy, "name": "healthy", "identity": { "type": "SystemAssigned", "principalId": "principal-3" } }),
    )
    .create();
    let _vault = json_mock("GET", &vault_id(sub), vault_body(sub, Some("principal-3"))).create();
    let add = json_mock("PUT", &format!("{}/accessPolicies/add", vault_id(sub)), json!({}))
        .expect(1)
        .create();
    let remove = json_mock("PUT", &format!("{}/accessPolicies/remove", vault_id(sub)), json!({}))
        .match_body(Matcher::Regex(r#""objectId":"principal-3""#.to_owned()))
        .expect(1)
        .create();
    let disable = json_mock("PATCH", &healthy, json!({}))
        .match_body(Matcher::Regex(r#""type":"None""#.to_owned()))
        .expect(1)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let outcomes = orchestrator.run(&mut context, &vault()).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].compute_id(), &broken);
    assert!(!outcomes[0].is_success());
    assert_eq!(outcomes[1].compute_id(), &healthy);
    assert!(outcomes[1].is_success(), "{:?}", outcomes[1].error());
    add.assert();
    remove.assert();
    disable.assert();
}

#[tokio::test]
async fn unknown_resource_group_means_nothing_to_do() {
    let sub = "sub-nolab";
    let _labs = labs_mock(sub);
    let lab_vms = mock(
        "GET",
        format!(
            "/subscriptions/{}/resourceGroups/unrelated/providers/Microsoft.DevTestLab/labs/build-lab/virtualmachines",
            sub
        )
        .as_str(),
    )
    .match_query(Matcher::Any)
    .expect(0)
    .create();

    let resource_uri = format!("/subscriptions/{}/resourceGroups/unrelated/providers/Microsoft.Compute/virtualMachines/x", sub);
    let mut context = ResourceContext::new("t1", sub, &resource_uri, "Grant Vault", "");
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    orchestrator.initialize(&mut context).await.unwrap();

    assert_eq!(context.lab_resource_group().as_deref(), Some("unrelated"));
    assert!(context.lab_name().is_none());
    let outcomes = orchestrator.grant_and_revoke(&context, &vault()).await.unwrap();
    assert!(outcomes.is_empty());
    lab_vms.assert();
}

#[tokio::test]
async fn lab_listing_failure_is_logged_not_raised() {
    let sub = "sub-labfail";
    let _labs = mock("GET", format!("/subscriptions/{}/providers/Microsoft.DevTestLab/labs", sub).as_str())
        .match_query(Matcher::Any)
        .with_status(403)
        .with_body(r#"{"error":{"code":"AuthorizationFailed"}}"#)
        .create();

    let mut context = context(sub);
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    orchestrator.initialize(&mut context).await.unwrap();

    assert!(context.lab_name().is_none());
    assert!(orchestrator.run(&mut context, &vault()).await.is_empty());
}

#[tokio::test]
async fn invalid_resource_uri_fails_initialization() {
    let mut context = ResourceContext::new("t1", "sub-invalid", "/subscriptions/sub-invalid", "Grant Vault", "");
    let mut orchestrator = IdentityGrantOrchestrator::with_schedule(client(), quick());
    let err = orchestrator.initialize(&mut context).await.unwrap_err();
    assert!(matches!(err, GrantError::InvalidResourceId(_)));
}
