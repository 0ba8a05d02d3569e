use colored::Colorize;

use crate::credentials::CredentialsRecord;

/// Per-step status output for the provisioning flows.
///
/// One line per step, colored for scanability; warnings carry the manual
/// remediation hint so a degraded run is still actionable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reporter {
    quiet: bool,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self { quiet: true }
    }

    pub fn step(&self, message: &str) {
        if !self.quiet {
            println!("{} {message}", "·".dimmed());
        }
    }

    pub fn ok(&self, message: &str) {
        if !self.quiet {
            println!("{} {message}", "✓".green());
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.quiet {
            eprintln!("{} {message}", "!".yellow().bold());
        }
    }

    pub fn fail(&self, message: &str) {
        if !self.quiet {
            eprintln!("{} {message}", "✗".red().bold());
        }
    }

    /// Print the credentials block. The secret value is retrievable only at
    /// creation time, so this is the one chance to copy it.
    pub fn credentials_block(&self, record: &CredentialsRecord) {
        if self.quiet {
            return;
        }
        let rule = "─".repeat(64);
        println!("{rule}");
        println!(
            "{}",
            "SAVE THESE VALUES NOW: the secret is shown exactly once"
                .yellow()
                .bold()
        );
        println!("{rule}");
        println!("  bot name:        {}", record.bot_name);
        println!("  resource group:  {}", record.resource_group);
        println!("  endpoint:        {}", record.endpoint);
        println!("  app id:          {}", record.app_id);
        println!("  app secret:      {}", record.app_secret.red());
        println!("  tenant id:       {}", record.tenant_id);
        println!("  subscription id: {}", record.subscription_id);
        println!("{rule}");
    }

    /// Print a rotated secret fragment; same one-time-visibility rule.
    pub fn secret_block(&self, app_id: &str, secret: &str, expires_at: &str) {
        if self.quiet {
            return;
        }
        let rule = "─".repeat(64);
        println!("{rule}");
        println!(
            "{}",
            "SAVE THIS SECRET NOW: it is shown exactly once".yellow().bold()
        );
        println!("{rule}");
        println!("  app id:     {app_id}");
        println!("  app secret: {}", secret.red());
        println!("  expires:    {expires_at}");
        println!("{rule}");
    }
}
