use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::botservice::{BotCreateParams, BotServiceClient};
use crate::credentials::CredentialsRecord;
use crate::error::ProvisionError;
use crate::graph::DirectoryClient;
use crate::report::Reporter;
use crate::validate;
use crate::DEFAULT_SECRET_VALIDITY_YEARS;

/// Blind wait inserted after secret and service-principal creation to
/// tolerate directory propagation lag. Not a retry.
const PROPAGATION_DELAY: Duration = Duration::from_secs(10);

/// Inputs for the create flow.
#[derive(Clone, Debug)]
pub struct CreateBotRequest {
    pub name: String,
    pub resource_group: String,
    pub endpoint: String,
    pub region: String,
    pub skip_consent: bool,
    /// Directory the credentials file is written into.
    pub output_dir: PathBuf,
}

/// Inputs for the teardown flow. Confirmation is the caller's concern; by
/// the time this reaches the orchestrator the operator has already agreed.
#[derive(Clone, Debug)]
pub struct TeardownRequest {
    pub name: String,
    pub resource_group: String,
    pub keep_registration: bool,
}

/// Fragment returned by the rotate flow. Previously issued secrets stay
/// valid until their own expiry.
#[derive(Clone, Debug)]
pub struct RotatedSecret {
    pub app_id: String,
    pub secret: String,
    pub expires_at: OffsetDateTime,
}

/// Compensating actions for irreversible steps, executed in reverse order
/// when a later step fails fatally.
enum UndoAction {
    DeleteApplication { object_id: String, name: String },
}

/// Drives the fixed provisioning sequence against the two control planes.
/// Strictly sequential; every step blocks on its remote round trip.
pub struct Provisioner<'a> {
    directory: &'a dyn DirectoryClient,
    bots: &'a dyn BotServiceClient,
    tenant_id: String,
    subscription_id: String,
    reporter: Reporter,
    propagation_delay: Duration,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        directory: &'a dyn DirectoryClient,
        bots: &'a dyn BotServiceClient,
        tenant_id: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            bots,
            tenant_id: tenant_id.into(),
            subscription_id: subscription_id.into(),
            reporter: Reporter::new(),
            propagation_delay: PROPAGATION_DELAY,
        }
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Override the propagation wait; tests set this to zero.
    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Create flow: registration → secret → permission → service principal →
    /// consent (best effort) → bot resource → Teams channel (best effort) →
    /// credentials record. Irreversible steps push an undo action; a fatal
    /// failure afterwards unwinds them in reverse before propagating.
    pub fn create(&self, request: &CreateBotRequest) -> Result<CredentialsRecord, ProvisionError> {
        validate::bot_name(&request.name)?;
        validate::https_endpoint(&request.endpoint)?;

        let mut undo: Vec<UndoAction> = Vec::new();

        self.reporter
            .step(&format!("ensuring resource group {}", request.resource_group));
        self.bots
            .ensure_resource_group(&request.resource_group, &request.region)
            .map_err(|err| self.fatal(&mut undo, "resourcegroup.ensure", err))?;
        self.reporter.ok(&format!(
            "resource group {} ready ({})",
            request.resource_group, request.region
        ));

        // Names are globally unique within the directory; an existing
        // registration is a conflict, never something to mutate.
        let existing = self
            .directory
            .find_application_by_name(&request.name)
            .map_err(|err| self.fatal(&mut undo, "registration.lookup", err))?;
        if existing.is_some() {
            self.reporter.fail(&format!(
                "an app registration named {} already exists",
                request.name
            ));
            return Err(ProvisionError::Conflict(format!(
                "app registration `{}` already exists; choose another bot name or tear it down first",
                request.name
            )));
        }

        self.reporter
            .step(&format!("creating app registration {}", request.name));
        let registration = self
            .directory
            .create_application(&request.name)
            .map_err(|err| self.fatal(&mut undo, "registration.create", err))?;
        info!(
            target = "provision",
            bot = %request.name,
            app_id = %registration.app_id,
            event = "registration.create.success",
            "app registration created"
        );
        undo.push(UndoAction::DeleteApplication {
            object_id: registration.object_id.clone(),
            name: request.name.clone(),
        });
        self.reporter
            .ok(&format!("app registration created (app id {})", registration.app_id));

        self.reporter.step("creating client secret");
        let secret = self
            .directory
            .add_password(
                &registration.object_id,
                &format!("{} provisioning", request.name),
                DEFAULT_SECRET_VALIDITY_YEARS,
            )
            .map_err(|err| self.fatal(&mut undo, "secret.create", err))?;
        self.reporter.ok("client secret created");
        self.wait_for_propagation("secret");

        self.reporter.step("declaring User.Read.All permission");
        self.directory
            .set_required_resource_access(&registration.object_id)
            .map_err(|err| self.fatal(&mut undo, "permission.declare", err))?;
        self.reporter.ok("directory-read permission declared");

        self.reporter.step("ensuring service principal");
        let sp_object_id = self
            .directory
            .ensure_service_principal(&registration.app_id)
            .map_err(|err| self.fatal(&mut undo, "serviceprincipal.ensure", err))?;
        self.reporter.ok("service principal ready");
        self.wait_for_propagation("service principal");

        if request.skip_consent {
            self.reporter.step("skipping admin consent (--skip-consent)");
        } else {
            self.reporter.step("granting admin consent");
            match self.directory.grant_admin_consent(&sp_object_id) {
                Ok(()) => self.reporter.ok("admin consent granted"),
                Err(err) => {
                    warn!(
                        target = "provision",
                        bot = %request.name,
                        error = %err,
                        event = "consent.grant.warning",
                        "admin consent could not be granted automatically"
                    );
                    self.reporter.warn(&format!(
                        "admin consent failed ({err}); have a tenant admin grant User.Read.All for app {} in the portal",
                        registration.app_id
                    ));
                }
            }
        }

        self.reporter
            .step(&format!("creating bot resource {}", request.name));
        let params = BotCreateParams {
            name: request.name.clone(),
            endpoint: request.endpoint.clone(),
            app_id: registration.app_id.clone(),
            tenant_id: self.tenant_id.clone(),
        };
        self.bots
            .create_bot(&request.resource_group, &params)
            .map_err(|err| self.fatal(&mut undo, "bot.create", err))?;
        info!(
            target = "provision",
            bot = %request.name,
            event = "bot.create.success",
            "bot resource created"
        );
        self.reporter.ok("bot resource created (single-tenant)");

        self.reporter.step("enabling Teams channel");
        match self
            .bots
            .enable_teams_channel(&request.resource_group, &request.name)
        {
            Ok(()) => self.reporter.ok("Teams channel enabled"),
            Err(err) => {
                warn!(
                    target = "provision",
                    bot = %request.name,
                    error = %err,
                    event = "channel.enable.warning",
                    "Teams channel could not be enabled"
                );
                self.reporter.warn(&format!(
                    "Teams channel enablement failed ({err}); enable it manually on the bot resource"
                ));
            }
        }

        let record = CredentialsRecord {
            bot_name: request.name.clone(),
            resource_group: request.resource_group.clone(),
            endpoint: request.endpoint.clone(),
            app_id: registration.app_id,
            app_secret: secret.secret_text,
            tenant_id: self.tenant_id.clone(),
            subscription_id: self.subscription_id.clone(),
        };
        match record.persist(&request.output_dir) {
            Ok(path) => self
                .reporter
                .ok(&format!("credentials written to {}", path.display())),
            Err(err) => self.reporter.warn(&format!(
                "failed to persist credentials file ({err}); copy the values below before closing this terminal"
            )),
        }
        self.reporter.credentials_block(&record);
        Ok(record)
    }

    /// Overwrite the bot's messaging endpoint. Single field, idempotent,
    /// no rollback needed.
    pub fn update_endpoint(
        &self,
        name: &str,
        resource_group: &str,
        endpoint: &str,
    ) -> Result<(), ProvisionError> {
        validate::https_endpoint(endpoint)?;

        let bot = self
            .bots
            .get_bot(resource_group, name)
            .map_err(|err| ProvisionError::remote("bot.lookup", err))?
            .ok_or_else(|| not_found(name, resource_group))?;
        self.bots
            .update_bot_endpoint(resource_group, &bot.name, endpoint)
            .map_err(|err| ProvisionError::remote("bot.update", err))?;
        info!(
            target = "provision",
            bot = %name,
            endpoint = %endpoint,
            event = "bot.update.success",
            "messaging endpoint updated"
        );
        self.reporter
            .ok(&format!("endpoint for {name} updated to {endpoint}"));
        Ok(())
    }

    /// Mint a new client secret for the bot's registration. Old secrets are
    /// deliberately left valid; removing them is a separate operator action.
    pub fn rotate_secret(
        &self,
        name: &str,
        resource_group: &str,
        years: u32,
    ) -> Result<RotatedSecret, ProvisionError> {
        validate::validity_years(years)?;

        let bot = self
            .bots
            .get_bot(resource_group, name)
            .map_err(|err| ProvisionError::remote("bot.lookup", err))?
            .ok_or_else(|| not_found(name, resource_group))?;
        let registration = self
            .directory
            .find_application_by_app_id(&bot.app_id)
            .map_err(|err| ProvisionError::remote("registration.lookup", err))?
            .ok_or_else(|| {
                ProvisionError::NotFound(format!(
                    "no app registration found for app id {}",
                    bot.app_id
                ))
            })?;

        self.reporter.step(&format!("rotating secret for {name}"));
        let secret = self
            .directory
            .add_password(
                &registration.object_id,
                &format!("{name} rotation"),
                years,
            )
            .map_err(|err| ProvisionError::remote("secret.create", err))?;
        info!(
            target = "provision",
            bot = %name,
            app_id = %registration.app_id,
            event = "secret.rotate.success",
            "new client secret created"
        );
        self.reporter
            .ok("new secret created; previous secrets remain valid until expiry");

        let rotated = RotatedSecret {
            app_id: registration.app_id,
            secret: secret.secret_text,
            expires_at: secret.expires_at,
        };
        self.reporter.secret_block(
            &rotated.app_id,
            &rotated.secret,
            &rotated
                .expires_at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| rotated.expires_at.to_string()),
        );
        Ok(rotated)
    }

    /// Teardown in reverse creation order: bot resource first, then (unless
    /// preserved) the app registration, so no dangling reference survives.
    pub fn teardown(&self, request: &TeardownRequest) -> Result<(), ProvisionError> {
        let bot = self
            .bots
            .get_bot(&request.resource_group, &request.name)
            .map_err(|err| ProvisionError::remote("bot.lookup", err))?
            .ok_or_else(|| not_found(&request.name, &request.resource_group))?;

        self.reporter
            .step(&format!("deleting bot resource {}", request.name));
        self.bots
            .delete_bot(&request.resource_group, &request.name)
            .map_err(|err| ProvisionError::remote("bot.delete", err))?;
        info!(
            target = "provision",
            bot = %request.name,
            event = "bot.delete.success",
            "bot resource deleted"
        );
        self.reporter.ok("bot resource deleted");

        if request.keep_registration {
            self.reporter.step(&format!(
                "keeping app registration for app id {} (--keep-registration)",
                bot.app_id
            ));
            return Ok(());
        }

        let registration = self
            .directory
            .find_application_by_app_id(&bot.app_id)
            .map_err(|err| ProvisionError::remote("registration.lookup", err))?;
        match registration {
            Some(registration) => {
                self.reporter.step("deleting app registration");
                self.directory
                    .delete_application(&registration.object_id)
                    .map_err(|err| ProvisionError::remote("registration.delete", err))?;
                info!(
                    target = "provision",
                    bot = %request.name,
                    app_id = %registration.app_id,
                    event = "registration.delete.success",
                    "app registration deleted"
                );
                self.reporter.ok("app registration deleted");
            }
            None => {
                // Tolerate a prior partial deletion.
                self.reporter.warn(&format!(
                    "app registration for app id {} was already gone",
                    bot.app_id
                ));
            }
        }
        Ok(())
    }

    fn wait_for_propagation(&self, what: &str) {
        if self.propagation_delay.is_zero() {
            return;
        }
        self.reporter.step(&format!(
            "waiting {}s for {what} propagation",
            self.propagation_delay.as_secs()
        ));
        thread::sleep(self.propagation_delay);
    }

    /// Unwind the undo stack in reverse order, then wrap the error with the
    /// failing step's name. Undo failures are warnings; the original error
    /// is the one that propagates.
    fn fatal(
        &self,
        undo: &mut Vec<UndoAction>,
        step: &'static str,
        source: anyhow::Error,
    ) -> ProvisionError {
        while let Some(action) = undo.pop() {
            match action {
                UndoAction::DeleteApplication { object_id, name } => {
                    info!(
                        target = "provision",
                        bot = %name,
                        event = "rollback.registration.delete",
                        "rolling back app registration"
                    );
                    self.reporter
                        .step(&format!("rolling back app registration {name}"));
                    if let Err(err) = self.directory.delete_application(&object_id) {
                        warn!(
                            target = "provision",
                            bot = %name,
                            error = %err,
                            event = "rollback.registration.warning",
                            "rollback deletion failed"
                        );
                        self.reporter.warn(&format!(
                            "rollback failed to delete registration {name} ({err}); delete it manually"
                        ));
                    }
                }
            }
        }
        self.reporter.fail(&format!("step `{step}` failed: {source}"));
        ProvisionError::remote(step, source)
    }
}

fn not_found(name: &str, resource_group: &str) -> ProvisionError {
    ProvisionError::NotFound(format!(
        "bot `{name}` not found in resource group `{resource_group}`"
    ))
}
