use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde::Deserialize;

const LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// First-party public client id used for the interactive device-code login
/// (the Azure CLI client, pre-consented for Graph and ARM in every tenant).
const DEVICE_LOGIN_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

/// Tokens are refreshed when they expire within this window.
const EXPIRY_SLACK: Duration = Duration::from_secs(30);

/// The two control planes the orchestrator talks to. Each needs its own
/// access token; scopes never mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Audience {
    Graph,
    Management,
}

impl Audience {
    fn scope(self) -> &'static str {
        match self {
            Audience::Graph => "https://graph.microsoft.com/.default",
            Audience::Management => "https://management.azure.com/.default",
        }
    }
}

enum Credential {
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
    DeviceCode {
        client_id: String,
    },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Explicit authenticated session passed into every client, rather than
/// ambient process-level login state. Holds one cached token per audience.
pub struct Session {
    http: HttpClient,
    tenant_id: String,
    subscription_id: String,
    credential: Credential,
    tokens: Mutex<BTreeMap<Audience, CachedToken>>,
    refresh_token: Mutex<Option<String>>,
}

impl Session {
    /// Build a session from the ambient environment. `AZURE_TENANT_ID` and
    /// `AZURE_SUBSCRIPTION_ID` are required; if `AZURE_CLIENT_ID` and
    /// `AZURE_CLIENT_SECRET` are both set the session authenticates
    /// silently, otherwise the first token request starts an interactive
    /// device-code login.
    pub fn from_env() -> Result<Self> {
        let tenant_id = std::env::var("AZURE_TENANT_ID")
            .context("AZURE_TENANT_ID must be set")?;
        let subscription_id = std::env::var("AZURE_SUBSCRIPTION_ID")
            .context("AZURE_SUBSCRIPTION_ID must be set")?;

        let client_id = std::env::var("AZURE_CLIENT_ID").ok();
        let client_secret = std::env::var("AZURE_CLIENT_SECRET").ok();
        let credential = match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Credential::ClientSecret {
                client_id,
                client_secret,
            },
            (client_id, _) => Credential::DeviceCode {
                client_id: client_id.unwrap_or_else(|| DEVICE_LOGIN_CLIENT_ID.into()),
            },
        };

        let http = HttpClient::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build login HTTP client")?;

        Ok(Self {
            http,
            tenant_id,
            subscription_id,
            credential,
            tokens: Mutex::new(BTreeMap::new()),
            refresh_token: Mutex::new(None),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Verify the session can authenticate, performing the interactive login
    /// if needed. Called once up front so later steps never stop for input.
    pub fn ensure_login(&self) -> Result<()> {
        self.token_for(Audience::Graph).map(|_| ())
    }

    /// Return a valid bearer token for the given control plane, acquiring or
    /// refreshing one if the cached token is missing or near expiry.
    pub fn token_for(&self, audience: Audience) -> Result<String> {
        {
            let guard = self.tokens.lock().expect("token cache lock poisoned");
            if let Some(token) = guard.get(&audience) {
                if token.expires_at > Instant::now() + EXPIRY_SLACK {
                    return Ok(token.value.clone());
                }
            }
        }

        let response = self.acquire(audience)?;
        let expires_at =
            Instant::now() + Duration::from_secs(response.expires_in.unwrap_or(3600).max(60));
        if let Some(refresh) = response.refresh_token.clone() {
            *self.refresh_token.lock().expect("refresh token lock poisoned") = Some(refresh);
        }
        let value = response.access_token.clone();
        self.tokens.lock().expect("token cache lock poisoned").insert(
            audience,
            CachedToken {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }

    fn acquire(&self, audience: Audience) -> Result<TokenResponse> {
        match &self.credential {
            Credential::ClientSecret {
                client_id,
                client_secret,
            } => self.client_credentials_grant(client_id, client_secret, audience),
            Credential::DeviceCode { client_id } => {
                let refresh = self
                    .refresh_token
                    .lock()
                    .expect("refresh token lock poisoned")
                    .clone();
                match refresh {
                    Some(token) => self.refresh_grant(client_id, &token, audience),
                    None => self.device_code_grant(client_id, audience),
                }
            }
        }
    }

    fn token_url(&self) -> String {
        format!("{LOGIN_BASE}/{}/oauth2/v2.0/token", self.tenant_id)
    }

    fn client_credentials_grant(
        &self,
        client_id: &str,
        client_secret: &str,
        audience: Audience,
    ) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", audience.scope()),
        ];
        let response = self
            .http
            .post(self.token_url())
            .form(&form)
            .send()
            .context("failed to reach token endpoint")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            bail!("token request failed {status}: {body}");
        }
        response.json().context("invalid token response")
    }

    fn refresh_grant(
        &self,
        client_id: &str,
        refresh_token: &str,
        audience: Audience,
    ) -> Result<TokenResponse> {
        let scope = format!("{} offline_access", audience.scope());
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        let response = self
            .http
            .post(self.token_url())
            .form(&form)
            .send()
            .context("failed to reach token endpoint")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            bail!("token refresh failed {status}: {body}");
        }
        response.json().context("invalid token response")
    }

    /// Interactive login: print the verification code and poll the token
    /// endpoint until the user completes the browser flow out of band.
    fn device_code_grant(&self, client_id: &str, audience: Audience) -> Result<TokenResponse> {
        let scope = format!("{} offline_access", audience.scope());
        let start_url = format!("{LOGIN_BASE}/{}/oauth2/v2.0/devicecode", self.tenant_id);
        let form = [("client_id", client_id), ("scope", scope.as_str())];
        let response = self
            .http
            .post(start_url)
            .form(&form)
            .send()
            .context("failed to start device-code login")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            bail!("device-code request failed {status}: {body}");
        }
        let device: DeviceCodeResponse =
            response.json().context("invalid device-code response")?;

        println!("{}", device.message);
        tracing::info!(
            target = "auth",
            verification_uri = %device.verification_uri,
            user_code = %device.user_code,
            "waiting for interactive sign-in"
        );

        let interval = Duration::from_secs(device.interval.unwrap_or(5).max(1));
        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        loop {
            thread::sleep(interval);
            if Instant::now() > deadline {
                bail!("device-code login expired before sign-in completed");
            }

            let poll = [
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("client_id", client_id),
                ("device_code", device.device_code.as_str()),
            ];
            let response = self
                .http
                .post(self.token_url())
                .form(&poll)
                .send()
                .context("failed to poll token endpoint")?;
            if response.status().is_success() {
                return response.json().context("invalid token response");
            }

            let body: serde_json::Value = response.json().unwrap_or_default();
            match body.get("error").and_then(|v| v.as_str()) {
                Some("authorization_pending") | Some("slow_down") => continue,
                Some("authorization_declined") => bail!("sign-in was declined"),
                Some("expired_token") => bail!("device code expired before sign-in completed"),
                other => {
                    return Err(anyhow!(
                        "device-code login failed: {}",
                        other.unwrap_or("unknown error")
                    ))
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    message: String,
    expires_in: u64,
    interval: Option<u64>,
}
