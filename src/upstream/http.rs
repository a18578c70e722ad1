use super::AccountDirectory;
use super::collector::CollectionWindow;
use crate::config::UpstreamConfig;
use crate::core::{AccountDescriptor, FlowlogError, Result, format_timestamp};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Side of the virtual network a flow-log record was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Destination,
    Source,
}

impl FlowDirection {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::Destination => "destvn",
            Self::Source => "sourcevn",
        }
    }
}

/// Raw flow-log records for one account and window.
#[async_trait]
pub trait FlowLogSource: Send + Sync {
    async fn fetch_records(
        &self,
        account_id: &str,
        window: &CollectionWindow,
        direction: FlowDirection,
    ) -> Result<Vec<Value>>;
}

fn build_client(config: &UpstreamConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()
        .map_err(|err| FlowlogError::Config(format!("Failed to build HTTP client: {}", err)))
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Debug, Deserialize)]
struct DescribeAccountsEnvelope {
    #[serde(rename = "DescribeFlowLogEnableAccountsResponse")]
    response: DescribeAccountsResponse,
}

#[derive(Debug, Default, Deserialize)]
struct DescribeAccountsResponse {
    #[serde(rename = "accountIds", default)]
    account_ids: Option<AccountItems>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountItems {
    #[serde(default)]
    item: Option<OneOrMany<AccountDescriptor>>,
}

/// Normalizes the describe-accounts payload, which carries a bare object when
/// exactly one account is enabled, into a list.
pub fn parse_enabled_accounts(body: &[u8]) -> Result<Vec<AccountDescriptor>> {
    let envelope: DescribeAccountsEnvelope = serde_json::from_slice(body)
        .map_err(|err| FlowlogError::Upstream(format!("Malformed accounts response: {}", err)))?;
    let accounts = match envelope.response.account_ids.and_then(|ids| ids.item) {
        None => Vec::new(),
        Some(OneOrMany::One(account)) => vec![account],
        Some(OneOrMany::Many(accounts)) => accounts,
    };
    Ok(accounts)
}

/// Account listing served by the VPC telemetry API.
#[derive(Debug, Clone)]
pub struct HttpAccountDirectory {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpAccountDirectory {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    async fn list_enabled_accounts(&self) -> Result<Vec<AccountDescriptor>> {
        let url = format!("{}/flowlog/accounts", self.base_url);
        let response = authorize(self.client.get(&url), self.token.as_deref())
            .send()
            .await
            .map_err(|err| FlowlogError::Upstream(format!("GET {} failed: {}", url, err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FlowlogError::Upstream(format!(
                "GET {} returned {}",
                url, status
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| FlowlogError::Upstream(format!("GET {} body: {}", url, err)))?;
        parse_enabled_accounts(&body)
    }
}

/// Flow-log records served by the VPC telemetry API.
#[derive(Debug, Clone)]
pub struct HttpFlowLogSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFlowLogSource {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl FlowLogSource for HttpFlowLogSource {
    async fn fetch_records(
        &self,
        account_id: &str,
        window: &CollectionWindow,
        direction: FlowDirection,
    ) -> Result<Vec<Value>> {
        let url = format!("{}/flowlog/records", self.base_url);
        let query = [
            ("account_id", account_id.to_string()),
            ("start_time", format_timestamp(&window.start)),
            ("end_time", format_timestamp(&window.end)),
            ("direction", direction.as_query().to_string()),
        ];
        let request = authorize(self.client.get(&url).query(&query), self.token.as_deref());
        let response = request
            .send()
            .await
            .map_err(|err| FlowlogError::collection(account_id, format!("GET {}: {}", url, err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FlowlogError::collection(
                account_id,
                format!("GET {} returned {}", url, status),
            ));
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|err| FlowlogError::collection(account_id, format!("GET {} body: {}", url, err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_account_object_is_normalized_to_list() {
        let body = br#"{"DescribeFlowLogEnableAccountsResponse": {"accountIds": {"item":
            {"projectId": "acc-1", "bucketName": "b-1", "enabledAt": "01-01-2024 00:00:00"}}}}"#;
        let accounts = parse_enabled_accounts(body).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id, "acc-1");
    }

    #[test]
    fn account_list_is_kept_in_order() {
        let body = br#"{"DescribeFlowLogEnableAccountsResponse": {"accountIds": {"item": [
            {"projectId": "acc-1", "bucketName": "b-1"},
            {"projectId": "acc-2", "bucketName": "b-2", "enabledAt": null}]}}}"#;
        let ids: Vec<String> = parse_enabled_accounts(body)
            .unwrap()
            .into_iter()
            .map(|account| account.account_id)
            .collect();
        assert_eq!(ids, vec!["acc-1".to_string(), "acc-2".to_string()]);
    }

    #[test]
    fn missing_items_mean_no_accounts() {
        let body = br#"{"DescribeFlowLogEnableAccountsResponse": {"accountIds": null}}"#;
        assert!(parse_enabled_accounts(body).unwrap().is_empty());
        let body = br#"{"DescribeFlowLogEnableAccountsResponse": {}}"#;
        assert!(parse_enabled_accounts(body).unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_an_upstream_error() {
        assert!(matches!(
            parse_enabled_accounts(b"<html>"),
            Err(FlowlogError::Upstream(_))
        ));
    }
}
