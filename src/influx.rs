//! HTTP client for an InfluxDB v2 server: the line-protocol write endpoint
//! and the handful of admin calls used when provisioning.

use crate::collector::PointSink;
use crate::error::{DeliveryError, ProvisionError};
use crate::provision::{AdminApi, Bucket, Organization, RetentionRule};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_URL: &str = "http://127.0.0.1:8086";
pub const DEFAULT_ORG: &str = "ServerMonitor";
pub const DEFAULT_TOKEN: &str = "ThisIsATokenExample=";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub timeout: Duration,
}

impl InfluxConfig {
    pub fn new(url: &str, token: &str, org: &str, bucket: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct InfluxClient {
    client: Client,
    config: InfluxConfig,
    auth: String,
}

#[derive(Deserialize)]
struct OrganizationList {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Deserialize)]
struct BucketList {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucket<'a> {
    #[serde(rename = "orgID")]
    org_id: &'a str,
    name: &'a str,
    retention_rules: Vec<RetentionRule>,
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let auth = format!("Token {}", config.token);
        Ok(Self {
            client,
            config,
            auth,
        })
    }

    pub fn config(&self) -> &InfluxConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.config.url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(self.endpoint(path))
            .header(AUTHORIZATION, &self.auth)
    }

    /// Send an admin request. `Ok(None)` means the server answered 404.
    async fn admin(
        &self,
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<Option<Response>, ProvisionError> {
        let response = request
            .send()
            .await
            .map_err(|source| ProvisionError::Http { op, source })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Status {
                op,
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(response))
    }
}

#[async_trait]
impl PointSink for InfluxClient {
    async fn write(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let url = self.endpoint("write");
        tracing::debug!("POST {} ({} bytes)", url, body.len());

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, &self.auth)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .body(body.to_vec())
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected { status, body })
        }
    }
}

#[async_trait]
impl AdminApi for InfluxClient {
    async fn find_organization(&self, name: &str) -> Result<Option<Organization>, ProvisionError> {
        const OP: &str = "find organization";
        let request = self.get("orgs").query(&[("org", name)]);
        let Some(response) = self.admin(OP, request).await? else {
            return Ok(None);
        };
        let list: OrganizationList = response
            .json()
            .await
            .map_err(|source| ProvisionError::Http { op: OP, source })?;
        Ok(list.orgs.into_iter().find(|o| o.name == name))
    }

    async fn find_bucket(&self, name: &str) -> Result<Option<Bucket>, ProvisionError> {
        const OP: &str = "find bucket";
        let request = self.get("buckets").query(&[("name", name)]);
        let Some(response) = self.admin(OP, request).await? else {
            return Ok(None);
        };
        let list: BucketList = response
            .json()
            .await
            .map_err(|source| ProvisionError::Http { op: OP, source })?;
        Ok(list.buckets.into_iter().find(|b| b.name == name))
    }

    async fn create_bucket(
        &self,
        org: &Organization,
        name: &str,
        retention_seconds: u64,
    ) -> Result<Bucket, ProvisionError> {
        const OP: &str = "create bucket";
        let body = CreateBucket {
            org_id: &org.id,
            name,
            retention_rules: vec![RetentionRule::expire(retention_seconds)],
        };
        let request = self
            .client
            .post(self.endpoint("buckets"))
            .header(AUTHORIZATION, &self.auth)
            .json(&body);
        let response = self
            .admin(OP, request)
            .await?
            .ok_or(ProvisionError::Status {
                op: OP,
                status: StatusCode::NOT_FOUND.as_u16(),
                body: String::new(),
            })?;
        response
            .json()
            .await
            .map_err(|source| ProvisionError::Http { op: OP, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let config = InfluxConfig::new("http://db:8086/", "t", "o", "b");
        let client = InfluxClient::new(config).unwrap();
        assert_eq!(client.endpoint("write"), "http://db:8086/api/v2/write");
    }

    #[test]
    fn create_request_uses_api_field_names() {
        let body = CreateBucket {
            org_id: "o1",
            name: "host1",
            retention_rules: vec![RetentionRule::expire(604800)],
        };
        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["orgID"], "o1");
        assert_eq!(json["name"], "host1");
        assert_eq!(json["retentionRules"][0]["type"], "expire");
        assert_eq!(json["retentionRules"][0]["everySeconds"], 604800);
    }

    #[test]
    fn organization_list_tolerates_missing_array() {
        let list: OrganizationList = serde_json::from_str("{}").unwrap();
        assert!(list.orgs.is_empty());
    }
}
