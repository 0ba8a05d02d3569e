use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::tempdir;
use time::OffsetDateTime;

use teams_provisioner::botservice::{BotCreateParams, BotResource, BotServiceClient};
use teams_provisioner::credentials::CredentialsRecord;
use teams_provisioner::error::ProvisionError;
use teams_provisioner::graph::{AppRegistration, DirectoryClient, PasswordCredential};
use teams_provisioner::provision::{CreateBotRequest, Provisioner, TeardownRequest};
use teams_provisioner::report::Reporter;

const TENANT: &str = "tenant-guid";
const SUBSCRIPTION: &str = "sub-guid";

#[derive(Default)]
struct DirectoryState {
    apps: Vec<MockApp>,
    next_id: u32,
    calls: u32,
    mutations: u32,
}

struct MockApp {
    object_id: String,
    app_id: String,
    display_name: String,
    secrets: Vec<String>,
    permission_declared: bool,
    service_principal: Option<String>,
    consented: bool,
}

#[derive(Default)]
struct MockDirectory {
    state: Mutex<DirectoryState>,
    fail_consent: bool,
}

impl MockDirectory {
    fn with_existing_app(name: &str) -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().unwrap();
            state.apps.push(MockApp {
                object_id: "obj-preexisting".into(),
                app_id: "app-preexisting".into(),
                display_name: name.into(),
                secrets: Vec::new(),
                permission_declared: false,
                service_principal: None,
                consented: false,
            });
        }
        mock
    }

    fn calls(&self) -> u32 {
        self.state.lock().unwrap().calls
    }

    fn mutations(&self) -> u32 {
        self.state.lock().unwrap().mutations
    }

    fn app_named(&self, name: &str) -> Option<(String, usize)> {
        let state = self.state.lock().unwrap();
        state
            .apps
            .iter()
            .find(|app| app.display_name == name)
            .map(|app| (app.app_id.clone(), app.secrets.len()))
    }

    fn remove_app_by_app_id(&self, app_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.apps.retain(|app| app.app_id != app_id);
    }

    fn grant_state(&self, name: &str) -> Option<(bool, bool)> {
        let state = self.state.lock().unwrap();
        state
            .apps
            .iter()
            .find(|app| app.display_name == name)
            .map(|app| (app.permission_declared, app.consented))
    }
}

impl DirectoryClient for MockDirectory {
    fn find_application_by_name(&self, name: &str) -> Result<Option<AppRegistration>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state
            .apps
            .iter()
            .find(|app| app.display_name == name)
            .map(to_registration))
    }

    fn find_application_by_app_id(&self, app_id: &str) -> Result<Option<AppRegistration>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state
            .apps
            .iter()
            .find(|app| app.app_id == app_id)
            .map(to_registration))
    }

    fn create_application(&self, name: &str) -> Result<AppRegistration> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        state.next_id += 1;
        let app = MockApp {
            object_id: format!("obj-{}", state.next_id),
            app_id: format!("app-{}", state.next_id),
            display_name: name.into(),
            secrets: Vec::new(),
            permission_declared: false,
            service_principal: None,
            consented: false,
        };
        let registration = to_registration(&app);
        state.apps.push(app);
        Ok(registration)
    }

    fn delete_application(&self, object_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        let before = state.apps.len();
        state.apps.retain(|app| app.object_id != object_id);
        if state.apps.len() == before {
            return Err(anyhow!("application {object_id} not found"));
        }
        Ok(())
    }

    fn add_password(
        &self,
        object_id: &str,
        _label: &str,
        years: u32,
    ) -> Result<PasswordCredential> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        state.next_id += 1;
        let secret = format!("secret-{}", state.next_id);
        let app = state
            .apps
            .iter_mut()
            .find(|app| app.object_id == object_id)
            .ok_or_else(|| anyhow!("application {object_id} not found"))?;
        app.secrets.push(secret.clone());
        Ok(PasswordCredential {
            secret_text: secret,
            expires_at: OffsetDateTime::now_utc() + time::Duration::days(365 * i64::from(years)),
        })
    }

    fn set_required_resource_access(&self, object_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        let app = state
            .apps
            .iter_mut()
            .find(|app| app.object_id == object_id)
            .ok_or_else(|| anyhow!("application {object_id} not found"))?;
        app.permission_declared = true;
        Ok(())
    }

    fn ensure_service_principal(&self, app_id: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        let app = state
            .apps
            .iter_mut()
            .find(|app| app.app_id == app_id)
            .ok_or_else(|| anyhow!("application {app_id} not found"))?;
        let sp = app
            .service_principal
            .get_or_insert_with(|| format!("sp-{app_id}"));
        Ok(sp.clone())
    }

    fn grant_admin_consent(&self, sp_object_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if self.fail_consent {
            return Err(anyhow!("consent requires a tenant administrator"));
        }
        state.mutations += 1;
        let app = state
            .apps
            .iter_mut()
            .find(|app| app.service_principal.as_deref() == Some(sp_object_id))
            .ok_or_else(|| anyhow!("service principal {sp_object_id} not found"))?;
        app.consented = true;
        Ok(())
    }
}

fn to_registration(app: &MockApp) -> AppRegistration {
    AppRegistration {
        object_id: app.object_id.clone(),
        app_id: app.app_id.clone(),
        display_name: app.display_name.clone(),
    }
}

#[derive(Default)]
struct BotState {
    groups: Vec<String>,
    bots: BTreeMap<String, BotResource>,
    channels: Vec<String>,
    calls: u32,
    mutations: u32,
}

#[derive(Default)]
struct MockBots {
    state: Mutex<BotState>,
    fail_create_bot: bool,
    fail_channel: bool,
}

impl MockBots {
    fn key(resource_group: &str, name: &str) -> String {
        format!("{resource_group}/{name}")
    }

    fn calls(&self) -> u32 {
        self.state.lock().unwrap().calls
    }

    fn mutations(&self) -> u32 {
        self.state.lock().unwrap().mutations
    }

    fn bot(&self, resource_group: &str, name: &str) -> Option<BotResource> {
        let state = self.state.lock().unwrap();
        state.bots.get(&Self::key(resource_group, name)).cloned()
    }

    fn channel_enabled(&self, resource_group: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.channels.contains(&Self::key(resource_group, name))
    }
}

impl BotServiceClient for MockBots {
    fn ensure_resource_group(&self, name: &str, _region: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        if !state.groups.iter().any(|g| g == name) {
            state.groups.push(name.into());
        }
        Ok(())
    }

    fn get_bot(&self, resource_group: &str, name: &str) -> Result<Option<BotResource>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.bots.get(&Self::key(resource_group, name)).cloned())
    }

    fn create_bot(&self, resource_group: &str, params: &BotCreateParams) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if self.fail_create_bot {
            return Err(anyhow!("bot service rejected the request"));
        }
        state.mutations += 1;
        state.bots.insert(
            Self::key(resource_group, &params.name),
            BotResource {
                name: params.name.clone(),
                app_id: params.app_id.clone(),
                endpoint: params.endpoint.clone(),
            },
        );
        Ok(())
    }

    fn update_bot_endpoint(
        &self,
        resource_group: &str,
        name: &str,
        endpoint: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        let bot = state
            .bots
            .get_mut(&Self::key(resource_group, name))
            .ok_or_else(|| anyhow!("bot {name} not found"))?;
        bot.endpoint = endpoint.into();
        Ok(())
    }

    fn delete_bot(&self, resource_group: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.mutations += 1;
        let key = Self::key(resource_group, name);
        state.bots.remove(&key);
        state.channels.retain(|c| c != &key);
        Ok(())
    }

    fn enable_teams_channel(&self, resource_group: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if self.fail_channel {
            return Err(anyhow!("channel registration unavailable"));
        }
        state.mutations += 1;
        let key = Self::key(resource_group, name);
        if !state.channels.contains(&key) {
            state.channels.push(key);
        }
        Ok(())
    }
}

fn provisioner<'a>(directory: &'a MockDirectory, bots: &'a MockBots) -> Provisioner<'a> {
    Provisioner::new(directory, bots, TENANT, SUBSCRIPTION)
        .with_reporter(Reporter::quiet())
        .with_propagation_delay(Duration::ZERO)
}

fn create_request(output_dir: PathBuf) -> CreateBotRequest {
    CreateBotRequest {
        name: "acme-bot".into(),
        resource_group: "acme-rg".into(),
        endpoint: "https://acme.example.com/api/messages".into(),
        region: "westus".into(),
        skip_consent: false,
        output_dir,
    }
}

#[test]
fn create_happy_path_returns_credentials_and_writes_file(
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots::default();

    let record = provisioner(&directory, &bots).create(&create_request(dir.path().into()))?;

    assert_eq!(record.bot_name, "acme-bot");
    assert!(!record.app_id.is_empty());
    assert!(!record.app_secret.is_empty());
    assert_eq!(record.tenant_id, TENANT);
    assert_eq!(record.subscription_id, SUBSCRIPTION);

    let path = dir.path().join("acme-bot-credentials.json");
    let persisted: CredentialsRecord = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(persisted, record);

    let bot = bots.bot("acme-rg", "acme-bot").expect("bot should exist");
    assert_eq!(bot.app_id, record.app_id);
    assert_eq!(bot.endpoint, "https://acme.example.com/api/messages");
    assert!(bots.channel_enabled("acme-rg", "acme-bot"));

    let (_, secret_count) = directory.app_named("acme-bot").expect("registration exists");
    assert_eq!(secret_count, 1);
    assert_eq!(directory.grant_state("acme-bot"), Some((true, true)));
    Ok(())
}

#[test]
fn create_rejects_malformed_name_before_any_remote_call() {
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let mut request = create_request(".".into());
    request.name = "1bad-name".into();

    let err = provisioner(&directory, &bots).create(&request).unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));
    assert_eq!(directory.calls(), 0);
    assert_eq!(bots.calls(), 0);
}

#[test]
fn create_rejects_non_https_endpoint_before_any_remote_call() {
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let mut request = create_request(".".into());
    request.endpoint = "http://acme.example.com/api/messages".into();

    let err = provisioner(&directory, &bots).create(&request).unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));
    assert_eq!(directory.calls(), 0);
    assert_eq!(bots.calls(), 0);
}

#[test]
fn create_conflicts_on_existing_registration_without_mutating_it() {
    let directory = MockDirectory::with_existing_app("acme-bot");
    let bots = MockBots::default();

    let err = provisioner(&directory, &bots)
        .create(&create_request(".".into()))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));

    // Only the resource-group ensure ran; nothing in the directory moved.
    assert_eq!(directory.mutations(), 0);
    assert!(bots.bot("acme-rg", "acme-bot").is_none());
    let (app_id, secret_count) = directory.app_named("acme-bot").unwrap();
    assert_eq!(app_id, "app-preexisting");
    assert_eq!(secret_count, 0);
}

#[test]
fn bot_create_failure_rolls_back_the_registration() {
    let directory = MockDirectory::default();
    let bots = MockBots {
        fail_create_bot: true,
        ..MockBots::default()
    };

    let err = provisioner(&directory, &bots)
        .create(&create_request(".".into()))
        .unwrap_err();
    assert_eq!(err.step(), Some("bot.create"));

    // The registration created in this run is gone, and no bot resource or
    // channel binding survives.
    assert!(directory.app_named("acme-bot").is_none());
    assert!(bots.bot("acme-rg", "acme-bot").is_none());
    assert!(!bots.channel_enabled("acme-rg", "acme-bot"));
}

#[test]
fn consent_failure_degrades_to_a_warning() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory {
        fail_consent: true,
        ..MockDirectory::default()
    };
    let bots = MockBots::default();

    let record = provisioner(&directory, &bots).create(&create_request(dir.path().into()))?;
    assert!(bots.bot("acme-rg", "acme-bot").is_some());
    assert!(!record.app_secret.is_empty());
    assert_eq!(directory.grant_state("acme-bot"), Some((true, false)));
    Ok(())
}

#[test]
fn channel_failure_degrades_to_a_warning_without_rollback(
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots {
        fail_channel: true,
        ..MockBots::default()
    };

    provisioner(&directory, &bots).create(&create_request(dir.path().into()))?;
    assert!(bots.bot("acme-rg", "acme-bot").is_some());
    assert!(!bots.channel_enabled("acme-rg", "acme-bot"));
    assert!(directory.app_named("acme-bot").is_some());
    Ok(())
}

#[test]
fn update_endpoint_changes_only_the_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let orchestrator = provisioner(&directory, &bots);
    let record = orchestrator.create(&create_request(dir.path().into()))?;

    orchestrator.update_endpoint("acme-bot", "acme-rg", "https://new.example.com/api/messages")?;

    let bot = bots.bot("acme-rg", "acme-bot").unwrap();
    assert_eq!(bot.endpoint, "https://new.example.com/api/messages");
    assert_eq!(bot.app_id, record.app_id);
    Ok(())
}

#[test]
fn update_endpoint_fails_for_missing_bot() {
    let directory = MockDirectory::default();
    let bots = MockBots::default();

    let err = provisioner(&directory, &bots)
        .update_endpoint("missing-bot", "acme-rg", "https://new.example.com/api")
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NotFound(_)));
}

#[test]
fn update_endpoint_rejects_plain_http() {
    let directory = MockDirectory::default();
    let bots = MockBots::default();

    let err = provisioner(&directory, &bots)
        .update_endpoint("acme-bot", "acme-rg", "http://new.example.com/api")
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));
    assert_eq!(bots.calls(), 0);
}

#[test]
fn rotate_secret_leaves_previous_secrets_valid() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let orchestrator = provisioner(&directory, &bots);
    let record = orchestrator.create(&create_request(dir.path().into()))?;

    let rotated = orchestrator.rotate_secret("acme-bot", "acme-rg", 3)?;

    assert_eq!(rotated.app_id, record.app_id);
    assert_ne!(rotated.secret, record.app_secret);
    let (_, secret_count) = directory.app_named("acme-bot").unwrap();
    assert_eq!(secret_count, 2, "old secret must survive rotation");
    Ok(())
}

#[test]
fn rotate_secret_validates_years_and_target() {
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let orchestrator = provisioner(&directory, &bots);

    let err = orchestrator.rotate_secret("acme-bot", "acme-rg", 0).unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));

    let err = orchestrator.rotate_secret("acme-bot", "acme-rg", 2).unwrap_err();
    assert!(matches!(err, ProvisionError::NotFound(_)));
}

#[test]
fn teardown_removes_bot_then_registration() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let orchestrator = provisioner(&directory, &bots);
    orchestrator.create(&create_request(dir.path().into()))?;

    orchestrator.teardown(&TeardownRequest {
        name: "acme-bot".into(),
        resource_group: "acme-rg".into(),
        keep_registration: false,
    })?;

    assert!(bots.bot("acme-rg", "acme-bot").is_none());
    assert!(directory.app_named("acme-bot").is_none());
    Ok(())
}

#[test]
fn teardown_with_keep_flag_preserves_the_registration(
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let orchestrator = provisioner(&directory, &bots);
    let record = orchestrator.create(&create_request(dir.path().into()))?;

    orchestrator.teardown(&TeardownRequest {
        name: "acme-bot".into(),
        resource_group: "acme-rg".into(),
        keep_registration: true,
    })?;

    assert!(bots.bot("acme-rg", "acme-bot").is_none());
    let kept = directory
        .find_application_by_app_id(&record.app_id)
        .unwrap();
    assert!(kept.is_some(), "registration must stay retrievable by app id");
    Ok(())
}

#[test]
fn teardown_of_missing_bot_fails_without_deleting_anything() {
    let directory = MockDirectory::default();
    let bots = MockBots::default();

    let err = provisioner(&directory, &bots)
        .teardown(&TeardownRequest {
            name: "missing-bot".into(),
            resource_group: "acme-rg".into(),
            keep_registration: false,
        })
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NotFound(_)));
    assert_eq!(bots.mutations(), 0);
    assert_eq!(directory.mutations(), 0);
}

#[test]
fn teardown_tolerates_an_already_deleted_registration(
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let directory = MockDirectory::default();
    let bots = MockBots::default();
    let orchestrator = provisioner(&directory, &bots);
    let record = orchestrator.create(&create_request(dir.path().into()))?;

    // Simulate a prior partial deletion.
    directory.remove_app_by_app_id(&record.app_id);

    orchestrator.teardown(&TeardownRequest {
        name: "acme-bot".into(),
        resource_group: "acme-rg".into(),
        keep_registration: false,
    })?;
    assert!(bots.bot("acme-rg", "acme-bot").is_none());
    Ok(())
}
