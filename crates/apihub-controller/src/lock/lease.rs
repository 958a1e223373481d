//! 基于 Kubernetes Lease 的协调服务

use apihub_common::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::debug;

use super::Coordinator;

/// Lease 协调服务
pub struct LeaseCoordinator {
    api: Api<Lease>,
}

impl LeaseCoordinator {
    /// 在指定命名空间中创建 Lease 协调服务
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn lease_spec(holder: &str, ttl: Duration, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(ttl.as_secs().max(1) as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
        }
    }

    /// 写入冲突说明有其他竞争者同时写入，本轮视为竞争失败
    async fn replace(&self, key: &str, lease: &Lease) -> Result<bool> {
        match self.api.replace(key, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(key, "Lease 写入冲突");
                Ok(false)
            }
            Err(e) => Err(Error::Coordination(e.to_string())),
        }
    }
}

fn is_expired(spec: &LeaseSpec) -> bool {
    let Some(renew_time) = &spec.renew_time else {
        return true;
    };
    let duration = chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(0) as i64);
    renew_time.0 + duration < Utc::now()
}

fn held_by(spec: &LeaseSpec, holder: &str) -> bool {
    spec.holder_identity.as_deref() == Some(holder)
}

#[async_trait]
impl Coordinator for LeaseCoordinator {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let existing = self
            .api
            .get_opt(key)
            .await
            .map_err(|e| Error::Coordination(e.to_string()))?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(key.to_string()),
                    ..Default::default()
                },
                spec: Some(Self::lease_spec(holder, ttl, 0)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(Error::Coordination(e.to_string())),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let vacant = spec.holder_identity.as_deref().map(str::is_empty).unwrap_or(true);
        if !vacant && !held_by(&spec, holder) && !is_expired(&spec) {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(!held_by(&spec, holder));
        lease.spec = Some(Self::lease_spec(holder, ttl, transitions));
        self.replace(key, &lease).await
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let Some(mut lease) = self
            .api
            .get_opt(key)
            .await
            .map_err(|e| Error::Coordination(e.to_string()))?
        else {
            return Ok(false);
        };

        let mut spec = lease.spec.clone().unwrap_or_default();
        if !held_by(&spec, holder) {
            return Ok(false);
        }
        spec.renew_time = Some(MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(ttl.as_secs().max(1) as i32);
        lease.spec = Some(spec);
        self.replace(key, &lease).await
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let Some(mut lease) = self
            .api
            .get_opt(key)
            .await
            .map_err(|e| Error::Coordination(e.to_string()))?
        else {
            return Ok(());
        };

        let mut spec = lease.spec.clone().unwrap_or_default();
        if !held_by(&spec, holder) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        lease.spec = Some(spec);
        // 冲突说明租约已被他人接管，无需再释放
        self.replace(key, &lease).await.map(|_| ())
    }
}
