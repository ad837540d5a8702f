//! Full flows against the in-memory sandbox with a filesystem wallet.

use product_ledger::ca::{Attribute, Registration, RegistrationRequest};
use product_ledger::config::Config;
use product_ledger::error::AppError;
use product_ledger::gateway::basic::Product;
use product_ledger::gateway::{Gateway, GatewayBackend, GatewayError};
use product_ledger::orchestrator::{DemoOptions, InitOutcome, Orchestrator};
use product_ledger::sandbox::Sandbox;
use product_ledger::wallet::Wallet;
use tempfile::TempDir;

const QUIET: DemoOptions = DemoOptions { skip_init: false, narrate: false };

async fn setup(dir: &TempDir) -> (Orchestrator, Sandbox) {
    let config = Config::memory_default(&dir.path().join("wallet"));
    let sandbox = Sandbox::for_config(&config).unwrap();
    let wallet = Wallet::open(&config.wallet_path).await.unwrap();
    (Orchestrator::new(config, wallet, sandbox.backends()), sandbox)
}

fn gateway_for(orch: &Orchestrator, sandbox: &Sandbox) -> Gateway {
    let config = orch.config();
    Gateway::new(
        GatewayBackend::Memory(sandbox.ledger().clone()),
        config.timeouts,
        config.orgs[0].discovery,
    )
}

#[tokio::test]
async fn demo_runs_then_reruns_idempotently() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;

    let first = orch.run_demo(QUIET).await.unwrap();
    assert!(first.admin && first.user);
    assert_eq!(first.init, InitOutcome::Committed);
    assert_eq!(first.steps.len(), 4);
    assert_eq!(first.steps[0].payload, b"[]");
    let sprite: Product = serde_json::from_slice(&first.steps[3].payload).unwrap();
    assert_eq!(sprite.name, "Sprite");
    assert_eq!(sprite.id, "2");

    let mut labels = orch.wallet().list().await.unwrap();
    labels.sort();
    assert_eq!(labels, ["appUser", "org1admin"]);
    assert!(dir.path().join("wallet").join("appUser.id").exists());

    let second = orch.run_demo(QUIET).await.unwrap();
    assert!(!second.admin && !second.user);
    assert_eq!(second.init, InitOutcome::AlreadyInitialized);
    let listed: Vec<Product> = serde_json::from_slice(&second.steps[0].payload).unwrap();
    let names: Vec<&str> = listed.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["Coca Cola", "Sprite"]);

    // No new CA traffic on the rerun.
    let ca = sandbox.ca(1).unwrap();
    assert_eq!(ca.enrollment_count("admin"), 1);
    assert_eq!(ca.enrollment_count("appUser"), 1);

    let history = sandbox.ledger().committed_transactions("mychannel");
    let functions: Vec<&str> = history.iter().map(|t| t.function.as_str()).collect();
    assert_eq!(
        functions,
        ["InitLedger", "CreateProduct", "CreateProduct", "CreateProduct", "CreateProduct"]
    );
    assert!(history.iter().all(|t| t.creator_msp == "Org1MSP"));
    assert_eq!(sandbox.ledger().open_sessions(), 0);
}

#[tokio::test]
async fn submitted_writes_are_visible_to_later_evaluations() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    orch.enroll_admin(None).await.unwrap();
    orch.register(orch.config().org(None).unwrap(), &RegistrationRequest::new("writer"))
        .await
        .unwrap();

    let mut gw = gateway_for(&orch, &sandbox);
    gw.connect(orch.wallet(), "writer").await.unwrap();
    let contract = gw.contract("mychannel", "basic").await.unwrap();

    let created: Product =
        serde_json::from_slice(&contract.submit("CreateProduct", &["Fanta", "can"]).await.unwrap()).unwrap();
    let fetched: Product =
        serde_json::from_slice(&contract.evaluate("QueryProduct", &[created.id.as_str()]).await.unwrap()).unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.owner, "writer");

    drop(contract);
    gw.disconnect().await;
    assert!(!gw.is_connected());
}

#[tokio::test]
async fn evaluate_never_changes_state_seen_by_others() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    orch.enroll_admin(None).await.unwrap();
    orch.register_user("reader", "auditor", None).await.unwrap();
    orch.register_user("other", "auditor", None).await.unwrap();

    let mut reader = gateway_for(&orch, &sandbox);
    reader.connect(orch.wallet(), "reader").await.unwrap();
    let mut other = gateway_for(&orch, &sandbox);
    other.connect(orch.wallet(), "other").await.unwrap();
    let by_reader = reader.contract("mychannel", "basic").await.unwrap();
    let by_other = other.contract("mychannel", "basic").await.unwrap();

    by_reader.evaluate("CreateProduct", &["Ghost", "never stored"]).await.unwrap();
    assert_eq!(by_other.evaluate("QueryAllProducts", &[]).await.unwrap(), b"[]");
    assert!(sandbox.ledger().committed_transactions("mychannel").is_empty());

    by_reader.submit("CreateProduct", &["Real", "stored"]).await.unwrap();
    let listed: Vec<Product> =
        serde_json::from_slice(&by_other.evaluate("QueryAllProducts", &[]).await.unwrap()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "Real");
    assert_eq!(listed[0].owner, "reader");

    drop((by_reader, by_other));
    reader.disconnect().await;
    other.disconnect().await;
}

async fn submitting_client(orch: &Orchestrator, sandbox: &Sandbox, label: &str) -> serde_json::Value {
    let mut gw = gateway_for(orch, sandbox);
    gw.connect(orch.wallet(), label).await.unwrap();
    let contract = gw.contract("mychannel", "basic").await.unwrap();
    let raw = contract.evaluate("GetSubmittingClientIdentity", &[]).await.unwrap();
    drop(contract);
    gw.disconnect().await;
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn ecert_attribute_reaches_the_contract_by_default() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    orch.enroll_admin(None).await.unwrap();
    let request = RegistrationRequest::new("carol").attribute(Attribute::new("role", "auditor", true));
    orch.register(orch.config().org(None).unwrap(), &request).await.unwrap();

    let json = submitting_client(&orch, &sandbox, "carol").await;
    assert_eq!(json["attributes"]["role"], "auditor");
    assert_eq!(json["attributes"]["hf.EnrollmentID"], "carol");
}

#[tokio::test]
async fn json_in_a_username_cannot_forge_attributes() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    orch.enroll_admin(None).await.unwrap();
    let username = r#"{"attrs":{"role":"admin"}}"#;
    let Registration::Registered(user) = orch.register_user(username, "buyer", None).await.unwrap() else {
        panic!("expected a fresh registration");
    };

    let attrs = user.attributes().unwrap();
    assert_eq!(attrs.get("role").map(String::as_str), Some("buyer"));
    assert_eq!(attrs.get("username").map(String::as_str), Some(username));

    let json = submitting_client(&orch, &sandbox, username).await;
    assert_eq!(json["attributes"]["role"], "buyer");
}

#[tokio::test]
async fn registered_role_reaches_the_contract() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    orch.enroll_admin(None).await.unwrap();
    let outcome = orch.register_user("bob", "auditor", None).await.unwrap();
    assert!(matches!(outcome, Registration::Registered(_)));
    assert!(matches!(
        orch.register_user("bob", "auditor", None).await.unwrap(),
        Registration::AlreadyRegistered
    ));

    let mut gw = gateway_for(&orch, &sandbox);
    gw.connect(orch.wallet(), "bob").await.unwrap();
    let contract = gw.contract("mychannel", "basic").await.unwrap();
    let raw = contract.evaluate("GetSubmittingClientIdentity", &[]).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["mspId"], "Org1MSP");
    assert_eq!(json["attributes"]["role"], "auditor");
    assert_eq!(json["attributes"]["username"], "bob");

    drop(contract);
    gw.disconnect().await;
}

#[tokio::test]
async fn unreachable_ledger_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    sandbox.ledger().set_reachable(false);

    let err = orch.run_demo(QUIET).await.unwrap_err();
    assert!(matches!(err, AppError::Gateway(GatewayError::Connection { .. })), "{err}");
    assert_eq!(sandbox.ledger().open_sessions(), 0);

    // Identities obtained before the failure stay in the wallet.
    assert!(orch.wallet().exists("org1admin").await.unwrap());
    assert!(orch.wallet().exists("appUser").await.unwrap());

    sandbox.ledger().set_reachable(true);
    let report = orch.run_demo(QUIET).await.unwrap();
    assert!(!report.admin && !report.user);
    assert_eq!(report.init, InitOutcome::Committed);
}

#[tokio::test]
async fn registration_without_admin_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;

    let err = orch.register_user("carol", "buyer", None).await.unwrap_err();
    match err {
        AppError::Enrollment(e) => assert!(e.is_not_found(), "{e}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!sandbox.ca(1).unwrap().is_registered("carol"));
    assert!(!orch.wallet().exists("carol").await.unwrap());
}

#[tokio::test]
async fn connecting_an_unknown_label_fails_before_the_network() {
    let dir = TempDir::new().unwrap();
    let (orch, sandbox) = setup(&dir).await;
    let mut gw = gateway_for(&orch, &sandbox);

    let err = gw.connect(orch.wallet(), "nobody").await.unwrap_err();
    assert!(matches!(err, GatewayError::Identity(_)));
    assert!(!gw.is_connected());
    assert!(matches!(gw.network("mychannel").await, Err(GatewayError::NotConnected)));

    // Idle disconnect is a no-op.
    gw.disconnect().await;
    assert_eq!(sandbox.ledger().open_sessions(), 0);
}
