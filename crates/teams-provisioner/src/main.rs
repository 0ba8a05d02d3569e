use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use teams_provisioner::auth::Session;
use teams_provisioner::botservice::LiveBotServiceClient;
use teams_provisioner::error::ProvisionError;
use teams_provisioner::graph::LiveDirectoryClient;
use teams_provisioner::manifest::TeamsAppManifest;
use teams_provisioner::provision::{CreateBotRequest, Provisioner, TeardownRequest};
use teams_provisioner::report::Reporter;
use teams_provisioner::{DEFAULT_REGION, DEFAULT_SECRET_VALIDITY_YEARS};

#[derive(Parser)]
#[command(name = "teamsprov", version)]
#[command(about = "Provision Microsoft Teams bot identities and channels in an Azure tenant")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the app registration, secret, bot resource, and Teams channel
    Create {
        /// Bot name: a letter followed by 2-35 alphanumeric or hyphen characters
        name: String,
        #[arg(long)]
        resource_group: String,
        /// Messaging endpoint; must be an HTTPS URL
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value = DEFAULT_REGION)]
        region: String,
        /// Skip the tenant admin consent step entirely
        #[arg(long)]
        skip_consent: bool,
        /// Directory the credentials file is written into
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Point an existing bot at a new messaging endpoint
    UpdateEndpoint {
        name: String,
        #[arg(long)]
        resource_group: String,
        #[arg(long)]
        endpoint: String,
    },
    /// Mint a new client secret; previously issued secrets stay valid
    RotateSecret {
        name: String,
        #[arg(long)]
        resource_group: String,
        /// Validity in years (1-5)
        #[arg(long, default_value_t = DEFAULT_SECRET_VALIDITY_YEARS)]
        years: u32,
    },
    /// Delete the bot resource and, unless kept, its app registration
    Teardown {
        name: String,
        #[arg(long)]
        resource_group: String,
        /// Keep the app registration; delete only the bot resource
        #[arg(long)]
        keep_registration: bool,
        /// Skip the interactive confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Stage a sideloadable Teams app manifest for an already-provisioned bot
    Package {
        /// Application (client) id of the provisioned bot
        #[arg(long)]
        app_id: String,
        /// Display name used in the manifest
        #[arg(long)]
        name: String,
        /// Messaging endpoint; its host becomes the allow-listed domain
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value = "./appPackage")]
        out: PathBuf,
        #[arg(long)]
        color_icon: Option<PathBuf>,
        #[arg(long)]
        outline_icon: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("{} {error}", "✗".red().bold());
        for cause in error.chain().skip(1) {
            eprintln!("    caused by: {cause}");
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Command::Create {
            name,
            resource_group,
            endpoint,
            region,
            skip_consent,
            output_dir,
        } => {
            let session = login()?;
            let directory = LiveDirectoryClient::new(session.clone())?;
            let bots = LiveBotServiceClient::new(session.clone())?;
            let provisioner = Provisioner::new(
                &directory,
                &bots,
                session.tenant_id(),
                session.subscription_id(),
            );
            provisioner.create(&CreateBotRequest {
                name,
                resource_group,
                endpoint,
                region,
                skip_consent,
                output_dir,
            })?;
        }
        Command::UpdateEndpoint {
            name,
            resource_group,
            endpoint,
        } => {
            let session = login()?;
            let directory = LiveDirectoryClient::new(session.clone())?;
            let bots = LiveBotServiceClient::new(session.clone())?;
            let provisioner = Provisioner::new(
                &directory,
                &bots,
                session.tenant_id(),
                session.subscription_id(),
            );
            provisioner.update_endpoint(&name, &resource_group, &endpoint)?;
        }
        Command::RotateSecret {
            name,
            resource_group,
            years,
        } => {
            let session = login()?;
            let directory = LiveDirectoryClient::new(session.clone())?;
            let bots = LiveBotServiceClient::new(session.clone())?;
            let provisioner = Provisioner::new(
                &directory,
                &bots,
                session.tenant_id(),
                session.subscription_id(),
            );
            provisioner.rotate_secret(&name, &resource_group, years)?;
        }
        Command::Teardown {
            name,
            resource_group,
            keep_registration,
            yes,
        } => {
            if !yes {
                let what = if keep_registration {
                    format!("bot resource `{name}`")
                } else {
                    format!("bot resource `{name}` and its app registration")
                };
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!("This will delete {what}. Continue?"))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    return Err(ProvisionError::Aborted("teardown declined".into()).into());
                }
            }
            let session = login()?;
            let directory = LiveDirectoryClient::new(session.clone())?;
            let bots = LiveBotServiceClient::new(session.clone())?;
            let provisioner = Provisioner::new(
                &directory,
                &bots,
                session.tenant_id(),
                session.subscription_id(),
            );
            provisioner.teardown(&TeardownRequest {
                name,
                resource_group,
                keep_registration,
            })?;
        }
        Command::Package {
            app_id,
            name,
            endpoint,
            out,
            color_icon,
            outline_icon,
        } => {
            let reporter = Reporter::new();
            let manifest = TeamsAppManifest::for_bot(&app_id, &name, &endpoint)?;
            let staged =
                manifest.stage(&out, color_icon.as_deref(), outline_icon.as_deref())?;
            for path in &staged {
                reporter.ok(&format!("staged {}", path.display()));
            }
            if staged.len() == 1 {
                reporter.warn(
                    "no icons supplied; add color.png (192x192) and outline.png (32x32) before zipping",
                );
            }
            reporter.ok(&format!(
                "zip the contents of {} and upload it in Teams via Apps > Manage your apps > Upload an app",
                out.display()
            ));
        }
    }
    Ok(())
}

/// Build the session and make sure it can authenticate before any flow
/// starts, so the interactive login happens up front.
fn login() -> Result<Arc<Session>> {
    let session = Arc::new(Session::from_env()?);
    session.ensure_login()?;
    Ok(session)
}
