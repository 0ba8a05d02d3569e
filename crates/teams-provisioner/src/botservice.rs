use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::auth::{Audience, Session};
use crate::error::error_is_not_found;
use crate::graph::api_error;

const ARM_BASE: &str = "https://management.azure.com";
const RESOURCE_GROUP_API_VERSION: &str = "2021-04-01";
const BOT_SERVICE_API_VERSION: &str = "2022-09-15";

/// The hosted bot service record as seen through ARM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotResource {
    pub name: String,
    pub app_id: String,
    pub endpoint: String,
}

/// Inputs for creating a single-tenant bot resource.
#[derive(Clone, Debug)]
pub struct BotCreateParams {
    pub name: String,
    pub endpoint: String,
    pub app_id: String,
    pub tenant_id: String,
}

/// Bot-hosting operations the orchestrator needs from the resource control
/// plane. Implemented live against ARM; tests substitute mocks.
pub trait BotServiceClient: Send + Sync {
    fn ensure_resource_group(&self, name: &str, region: &str) -> Result<()>;
    fn get_bot(&self, resource_group: &str, name: &str) -> Result<Option<BotResource>>;
    fn create_bot(&self, resource_group: &str, params: &BotCreateParams) -> Result<()>;
    fn update_bot_endpoint(&self, resource_group: &str, name: &str, endpoint: &str)
        -> Result<()>;
    fn delete_bot(&self, resource_group: &str, name: &str) -> Result<()>;
    /// Enable the Teams channel binding. Idempotent on re-run.
    fn enable_teams_channel(&self, resource_group: &str, name: &str) -> Result<()>;
}

pub struct LiveBotServiceClient {
    http: HttpClient,
    session: Arc<Session>,
}

impl LiveBotServiceClient {
    pub fn new(session: Arc<Session>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build ARM HTTP client")?;
        Ok(Self { http, session })
    }

    fn bot_url(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{ARM_BASE}/subscriptions/{}/resourceGroups/{resource_group}/providers/Microsoft.BotService/botServices/{name}?api-version={BOT_SERVICE_API_VERSION}",
            self.session.subscription_id(),
        )
    }

    fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .bearer_auth(self.session.token_for(Audience::Management)?)
            .header("Accept", "application/json")
            .send()
            .context("ARM API call failed")?;
        if response.status().is_success() {
            response.json::<T>().context("failed to parse ARM response")
        } else {
            Err(api_error(response).into())
        }
    }

    fn send_no_content(&self, builder: RequestBuilder) -> Result<()> {
        let response = builder
            .bearer_auth(self.session.token_for(Audience::Management)?)
            .send()
            .context("ARM API call failed")?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).into())
        }
    }
}

impl BotServiceClient for LiveBotServiceClient {
    fn ensure_resource_group(&self, name: &str, region: &str) -> Result<()> {
        let url = format!(
            "{ARM_BASE}/subscriptions/{}/resourcegroups/{name}?api-version={RESOURCE_GROUP_API_VERSION}",
            self.session.subscription_id(),
        );
        let payload = json!({ "location": region });
        let _: Value = self.send_json(self.http.put(url).json(&payload))?;
        Ok(())
    }

    fn get_bot(&self, resource_group: &str, name: &str) -> Result<Option<BotResource>> {
        let result: Result<Value> =
            self.send_json(self.http.get(self.bot_url(resource_group, name)));
        match result {
            Ok(value) => Ok(Some(value_to_bot(&value)?)),
            Err(err) if error_is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_bot(&self, resource_group: &str, params: &BotCreateParams) -> Result<()> {
        let payload = json!({
            "location": "global",
            "kind": "azurebot",
            "sku": { "name": "F0" },
            "properties": {
                "displayName": params.name,
                "endpoint": params.endpoint,
                "msaAppType": "SingleTenant",
                "msaAppId": params.app_id,
                "msaAppTenantId": params.tenant_id,
            },
        });
        let _: Value = self.send_json(
            self.http
                .put(self.bot_url(resource_group, &params.name))
                .json(&payload),
        )?;
        Ok(())
    }

    fn update_bot_endpoint(
        &self,
        resource_group: &str,
        name: &str,
        endpoint: &str,
    ) -> Result<()> {
        let payload = json!({
            "properties": { "endpoint": endpoint },
        });
        let _: Value = self.send_json(
            self.http
                .patch(self.bot_url(resource_group, name))
                .json(&payload),
        )?;
        Ok(())
    }

    fn delete_bot(&self, resource_group: &str, name: &str) -> Result<()> {
        self.send_no_content(self.http.delete(self.bot_url(resource_group, name)))
    }

    fn enable_teams_channel(&self, resource_group: &str, name: &str) -> Result<()> {
        let url = format!(
            "{ARM_BASE}/subscriptions/{}/resourceGroups/{resource_group}/providers/Microsoft.BotService/botServices/{name}/channels/MsTeamsChannel?api-version={BOT_SERVICE_API_VERSION}",
            self.session.subscription_id(),
        );
        let payload = json!({
            "location": "global",
            "properties": {
                "channelName": "MsTeamsChannel",
                "properties": { "isEnabled": true },
            },
        });
        let _: Value = self.send_json(self.http.put(url).json(&payload))?;
        Ok(())
    }
}

fn value_to_bot(value: &Value) -> Result<BotResource> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("bot resource missing name"))?
        .to_string();
    let app_id = value
        .pointer("/properties/msaAppId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("bot resource missing msaAppId"))?
        .to_string();
    let endpoint = value
        .pointer("/properties/endpoint")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(BotResource {
        name,
        app_id,
        endpoint,
    })
}
