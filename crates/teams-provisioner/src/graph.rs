use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::auth::{Audience, Session};
use crate::error::{error_is_conflict, HttpApiError};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Microsoft Graph's own resource application id; every tenant has a service
/// principal for it. Fixed for all invocations.
pub const MSGRAPH_RESOURCE_APP_ID: &str = "00000003-0000-0000-c000-000000000000";

/// The `User.Read.All` application role on Microsoft Graph. Fixed for all
/// invocations; never derived from user input.
pub const USER_READ_ALL_ROLE_ID: &str = "df021288-bdef-4463-88db-98f22de89214";

/// An app registration in the tenant directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppRegistration {
    /// Directory object id; the handle for mutation and deletion.
    pub object_id: String,
    /// The application (client) id other resources bind to.
    pub app_id: String,
    pub display_name: String,
}

/// A freshly minted client secret. `secret_text` is retrievable only at
/// creation time, never again.
#[derive(Clone, Debug)]
pub struct PasswordCredential {
    pub secret_text: String,
    pub expires_at: OffsetDateTime,
}

/// Directory operations the orchestrator needs from the identity control
/// plane. Implemented live against Microsoft Graph; tests substitute mocks.
pub trait DirectoryClient: Send + Sync {
    fn find_application_by_name(&self, name: &str) -> Result<Option<AppRegistration>>;
    fn find_application_by_app_id(&self, app_id: &str) -> Result<Option<AppRegistration>>;
    fn create_application(&self, name: &str) -> Result<AppRegistration>;
    fn delete_application(&self, object_id: &str) -> Result<()>;
    fn add_password(&self, object_id: &str, label: &str, years: u32)
        -> Result<PasswordCredential>;
    fn set_required_resource_access(&self, object_id: &str) -> Result<()>;
    /// Create the service principal for `app_id` if absent; returns its
    /// directory object id either way.
    fn ensure_service_principal(&self, app_id: &str) -> Result<String>;
    fn grant_admin_consent(&self, sp_object_id: &str) -> Result<()>;
}

pub struct LiveDirectoryClient {
    http: HttpClient,
    session: Arc<Session>,
}

impl LiveDirectoryClient {
    pub fn new(session: Arc<Session>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build Graph HTTP client")?;
        Ok(Self { http, session })
    }

    fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .bearer_auth(self.session.token_for(Audience::Graph)?)
            .header("Accept", "application/json")
            .send()
            .context("Graph API call failed")?;
        if response.status().is_success() {
            response.json::<T>().context("failed to parse Graph response")
        } else {
            Err(api_error(response).into())
        }
    }

    fn send_no_content(&self, builder: RequestBuilder) -> Result<()> {
        let response = builder
            .bearer_auth(self.session.token_for(Audience::Graph)?)
            .send()
            .context("Graph API call failed")?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).into())
        }
    }

    fn find_application(&self, filter: &str) -> Result<Option<AppRegistration>> {
        let response: Value = self.send_json(
            self.http
                .get(format!("{GRAPH_BASE}/applications"))
                .query(&[("$filter", filter), ("$top", "1")]),
        )?;
        let entry = response
            .get("value")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first());
        match entry {
            Some(value) => Ok(Some(value_to_registration(value)?)),
            None => Ok(None),
        }
    }

    fn find_service_principal(&self, app_id: &str) -> Result<Option<String>> {
        let filter = format!("appId eq '{}'", escape_odata(app_id));
        let response: Value = self.send_json(
            self.http
                .get(format!("{GRAPH_BASE}/servicePrincipals"))
                .query(&[("$filter", filter.as_str()), ("$top", "1")]),
        )?;
        Ok(response
            .get("value")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|entry| entry.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

impl DirectoryClient for LiveDirectoryClient {
    fn find_application_by_name(&self, name: &str) -> Result<Option<AppRegistration>> {
        let filter = format!("displayName eq '{}'", escape_odata(name));
        self.find_application(&filter)
    }

    fn find_application_by_app_id(&self, app_id: &str) -> Result<Option<AppRegistration>> {
        let filter = format!("appId eq '{}'", escape_odata(app_id));
        self.find_application(&filter)
    }

    fn create_application(&self, name: &str) -> Result<AppRegistration> {
        let payload = json!({
            "displayName": name,
            "signInAudience": "AzureADMyOrg",
        });
        let value: Value = self.send_json(
            self.http
                .post(format!("{GRAPH_BASE}/applications"))
                .json(&payload),
        )?;
        value_to_registration(&value)
    }

    fn delete_application(&self, object_id: &str) -> Result<()> {
        self.send_no_content(
            self.http
                .delete(format!("{GRAPH_BASE}/applications/{object_id}")),
        )
    }

    fn add_password(
        &self,
        object_id: &str,
        label: &str,
        years: u32,
    ) -> Result<PasswordCredential> {
        let end = OffsetDateTime::now_utc() + time::Duration::days(365 * i64::from(years));
        let end_formatted = end
            .format(&Rfc3339)
            .context("failed to format secret expiry")?;
        let payload = json!({
            "passwordCredential": {
                "displayName": label,
                "endDateTime": end_formatted,
            }
        });
        let value: Value = self.send_json(
            self.http
                .post(format!("{GRAPH_BASE}/applications/{object_id}/addPassword"))
                .json(&payload),
        )?;
        let secret_text = value
            .get("secretText")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("addPassword response missing secretText"))?
            .to_string();
        let expires_at = value
            .get("endDateTime")
            .and_then(Value::as_str)
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
            .unwrap_or(end);
        Ok(PasswordCredential {
            secret_text,
            expires_at,
        })
    }

    fn set_required_resource_access(&self, object_id: &str) -> Result<()> {
        let payload = json!({
            "requiredResourceAccess": [{
                "resourceAppId": MSGRAPH_RESOURCE_APP_ID,
                "resourceAccess": [{
                    "id": USER_READ_ALL_ROLE_ID,
                    "type": "Role",
                }],
            }],
        });
        self.send_no_content(
            self.http
                .patch(format!("{GRAPH_BASE}/applications/{object_id}"))
                .json(&payload),
        )
    }

    fn ensure_service_principal(&self, app_id: &str) -> Result<String> {
        let payload = json!({ "appId": app_id });
        let created: Result<Value> = self.send_json(
            self.http
                .post(format!("{GRAPH_BASE}/servicePrincipals"))
                .json(&payload),
        );
        match created {
            Ok(value) => value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("servicePrincipal response missing id")),
            Err(err) if error_is_conflict(&err) => {
                // Already instantiated in this tenant; look it up instead.
                self.find_service_principal(app_id)?
                    .ok_or_else(|| anyhow!("service principal for {app_id} reported as existing but not found"))
            }
            Err(err) => Err(err),
        }
    }

    fn grant_admin_consent(&self, sp_object_id: &str) -> Result<()> {
        let resource_sp = self
            .find_service_principal(MSGRAPH_RESOURCE_APP_ID)?
            .ok_or_else(|| anyhow!("Microsoft Graph service principal not found in tenant"))?;
        let payload = json!({
            "principalId": sp_object_id,
            "resourceId": resource_sp,
            "appRoleId": USER_READ_ALL_ROLE_ID,
        });
        let _: Value = self.send_json(
            self.http
                .post(format!(
                    "{GRAPH_BASE}/servicePrincipals/{sp_object_id}/appRoleAssignments"
                ))
                .json(&payload),
        )?;
        Ok(())
    }
}

fn value_to_registration(value: &Value) -> Result<AppRegistration> {
    let object_id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("application missing id"))?
        .to_string();
    let app_id = value
        .get("appId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("application missing appId"))?
        .to_string();
    let display_name = value
        .get("displayName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(AppRegistration {
        object_id,
        app_id,
        display_name,
    })
}

/// Single quotes double inside OData string literals.
fn escape_odata(value: &str) -> String {
    value.replace('\'', "''")
}

pub(crate) fn api_error(response: reqwest::blocking::Response) -> HttpApiError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let body = response.text().unwrap_or_default();
    if status.is_server_error() {
        warn!(target = "remote", %status, "control plane returned a server error");
    }
    HttpApiError {
        status,
        body,
        retry_after,
    }
}
