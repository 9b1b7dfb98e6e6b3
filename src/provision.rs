//! One-time startup checks that the destination bucket exists.

use crate::error::ProvisionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::CStr;
use std::io;

/// Retention given to buckets this tool creates: seven days.
pub const DEFAULT_RETENTION_SECONDS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub every_seconds: u64,
}

impl RetentionRule {
    pub fn expire(every_seconds: u64) -> Self {
        Self {
            kind: "expire".to_string(),
            every_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "orgID", default)]
    pub org_id: String,
    #[serde(default)]
    pub retention_rules: Vec<RetentionRule>,
}

/// The subset of the store's admin API needed at startup.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn find_organization(&self, name: &str) -> Result<Option<Organization>, ProvisionError>;

    async fn find_bucket(&self, name: &str) -> Result<Option<Bucket>, ProvisionError>;

    async fn create_bucket(
        &self,
        org: &Organization,
        name: &str,
        retention_seconds: u64,
    ) -> Result<Bucket, ProvisionError>;
}

/// Make sure `bucket` exists in `org`, creating it with the given retention
/// if needed. Safe to call on every start.
pub async fn ensure_bucket(
    api: &dyn AdminApi,
    org: &str,
    bucket: &str,
    retention_seconds: u64,
) -> Result<Bucket, ProvisionError> {
    let organization = api
        .find_organization(org)
        .await?
        .ok_or_else(|| ProvisionError::OrganizationNotFound(org.to_string()))?;
    tracing::debug!("Organization {} has id {}", organization.name, organization.id);

    if let Some(existing) = api.find_bucket(bucket).await? {
        tracing::info!("Using existing bucket {}", existing.name);
        return Ok(existing);
    }

    tracing::info!(
        "Creating bucket {} in {} with {}s retention",
        bucket,
        organization.name,
        retention_seconds
    );
    api.create_bucket(&organization, bucket, retention_seconds)
        .await
}

/// The machine's hostname, used as the default bucket name.
pub fn local_hostname() -> Result<String, ProvisionError> {
    let mut buf = [0 as libc::c_char; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return Err(ProvisionError::Hostname(io::Error::last_os_error()));
    }
    // gethostname may not terminate a truncated name.
    buf[buf.len() - 1] = 0;
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeAdmin {
        orgs: Vec<Organization>,
        buckets: Mutex<Vec<Bucket>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeAdmin {
        fn with_org(name: &str) -> Self {
            Self {
                orgs: vec![Organization {
                    id: "0123456789abcdef".into(),
                    name: name.into(),
                }],
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AdminApi for FakeAdmin {
        async fn find_organization(
            &self,
            name: &str,
        ) -> Result<Option<Organization>, ProvisionError> {
            self.calls.lock().unwrap().push(format!("find_org {name}"));
            Ok(self.orgs.iter().find(|o| o.name == name).cloned())
        }

        async fn find_bucket(&self, name: &str) -> Result<Option<Bucket>, ProvisionError> {
            self.calls.lock().unwrap().push(format!("find_bucket {name}"));
            Ok(self
                .buckets
                .lock()
                .unwrap()
                .iter()
                .find(|b| b.name == name)
                .cloned())
        }

        async fn create_bucket(
            &self,
            org: &Organization,
            name: &str,
            retention_seconds: u64,
        ) -> Result<Bucket, ProvisionError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create_bucket {name} {retention_seconds}"));
            let bucket = Bucket {
                id: "b1".into(),
                name: name.into(),
                org_id: org.id.clone(),
                retention_rules: vec![RetentionRule::expire(retention_seconds)],
            };
            self.buckets.lock().unwrap().push(bucket.clone());
            Ok(bucket)
        }
    }

    #[tokio::test]
    async fn creates_missing_bucket_with_week_retention() {
        let api = FakeAdmin::with_org("ServerMonitor");

        let bucket = ensure_bucket(&api, "ServerMonitor", "host1", DEFAULT_RETENTION_SECONDS)
            .await
            .unwrap();

        assert_eq!(bucket.name, "host1");
        assert_eq!(bucket.org_id, "0123456789abcdef");
        assert_eq!(bucket.retention_rules, vec![RetentionRule::expire(604800)]);
        assert_eq!(
            api.calls(),
            [
                "find_org ServerMonitor",
                "find_bucket host1",
                "create_bucket host1 604800"
            ]
        );
    }

    #[tokio::test]
    async fn existing_bucket_is_reused() {
        let api = FakeAdmin::with_org("ServerMonitor");
        ensure_bucket(&api, "ServerMonitor", "host1", DEFAULT_RETENTION_SECONDS)
            .await
            .unwrap();

        ensure_bucket(&api, "ServerMonitor", "host1", DEFAULT_RETENTION_SECONDS)
            .await
            .unwrap();

        let creates = api
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_bucket"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn missing_organization_is_fatal() {
        let api = FakeAdmin::with_org("ServerMonitor");

        let err = ensure_bucket(&api, "Other", "host1", DEFAULT_RETENTION_SECONDS)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::OrganizationNotFound(ref name) if name == "Other"));
        assert_eq!(api.calls(), ["find_org Other"]);
    }

    #[test]
    fn retention_rule_serializes_like_the_api_expects() {
        let json = serde_json::to_string(&RetentionRule::expire(604800)).unwrap();
        assert_eq!(json, r#"{"type":"expire","everySeconds":604800}"#);
    }

    #[test]
    fn bucket_deserializes_org_id() {
        let bucket: Bucket = serde_json::from_str(
            r#"{"id":"b1","name":"host1","orgID":"o1","retentionRules":[{"type":"expire","everySeconds":3600}],"type":"user"}"#,
        )
        .unwrap();
        assert_eq!(bucket.org_id, "o1");
        assert_eq!(bucket.retention_rules[0].every_seconds, 3600);
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!local_hostname().unwrap().is_empty());
    }
}
