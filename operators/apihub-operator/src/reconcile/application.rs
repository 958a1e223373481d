//! 应用协调

use apihub_common::{
    Action, Application, Error, ManagedResource, Phase, PublishStatus, RelationKind, ResourceKind,
    Result,
};
use apihub_controller::gateway::{ConsumerRequest, JwtRequest};
use apihub_controller::utils::{acl_group, gateway_name};
use apihub_controller::{modify, ResourceStore};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{merge_list, Context, Handler, NextPhase, StateTable};

/// 应用操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationOp {
    Publish,
    Update,
    Delete,
}

pub struct ApplicationHandler {
    table: StateTable<ApplicationOp>,
}

impl ApplicationHandler {
    pub fn new() -> Self {
        let any = [Phase::Any];
        let table = StateTable::new(ResourceKind::Application)
            .on(&any, Action::Publish, ApplicationOp::Publish, NextPhase::Stay)
            .on(&any, Action::Update, ApplicationOp::Update, NextPhase::Stay)
            .on(&any, Action::Delete, ApplicationOp::Delete, NextPhase::Removed);
        Self { table }
    }

    async fn publish(&self, ctx: &Context, app: &mut Application) -> Result<String> {
        validate(app)?;
        let namespace = app.namespace_or_default();
        let name = app.name_any();

        let consumer_id = match app.status.as_ref().and_then(|s| s.consumer_id.clone()) {
            Some(id) => id,
            None => {
                let username = gateway_name(&namespace, &name);
                let consumer = ctx
                    .gateway
                    .create_consumer(&ConsumerRequest {
                        username: username.clone(),
                        custom_id: username,
                    })
                    .await?;
                app.status.get_or_insert_with(Default::default).consumer_id = Some(consumer.id.clone());
                consumer.id
            }
        };

        if app.status.as_ref().and_then(|s| s.jwt_key.as_ref()).is_none() {
            let request = app
                .spec
                .credential
                .as_ref()
                .map(|c| JwtRequest {
                    key: Some(c.key.clone()),
                    secret: Some(c.secret.clone()),
                })
                .unwrap_or_default();
            let credential = ctx.gateway.create_jwt_credential(&consumer_id, &request).await?;
            let status = app.status.get_or_insert_with(Default::default);
            status.jwt_key = Some(credential.key);
            status.jwt_secret = Some(credential.secret);
        }

        // 发布前已绑定的 Api 此时补齐 ACL 分组
        for api_name in app.spec.apis.clone() {
            let released = match ctx.stores.apis.get(&namespace, &api_name).await {
                Ok(api) => api.status.map(|s| s.publish_status) == Some(PublishStatus::Released),
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if released {
                ctx.gateway
                    .add_consumer_acl(&consumer_id, &acl_group(&namespace, &api_name))
                    .await?;
            } else {
                debug!(namespace = %namespace, app = %name, api = %api_name, "Api 未发布，跳过 ACL");
            }
        }

        app.status.get_or_insert_with(Default::default).api_count = app.spec.apis.len() as u64;
        info!(namespace = %namespace, name = %name, consumer_id = %consumer_id, "应用已发布");
        Ok(format!("应用已发布，consumer {}", consumer_id))
    }

    async fn delete(&self, ctx: &Context, app: &mut Application) -> Result<String> {
        let namespace = app.namespace_or_default();
        let name = app.name_any();

        for api_name in app.spec.apis.clone() {
            let app_name = name.clone();
            modify(&*ctx.stores.apis, &namespace, &api_name, move |api| {
                api.spec.applications.retain(|a| a != &app_name);
                api.spec.relations.remove(RelationKind::Application, &app_name);
                Ok(true)
            })
            .await?;
        }

        // 删除 consumer 时网关一并删除其 ACL 分组与凭证
        if let Some(consumer_id) = app.status.as_ref().and_then(|s| s.consumer_id.clone()) {
            ctx.gateway.delete_consumer(&consumer_id).await?;
        }

        info!(namespace = %namespace, name = %name, "应用已删除");
        Ok("应用已删除".to_string())
    }
}

impl Default for ApplicationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ApplicationHandler {
    type Resource = Application;
    type Operation = ApplicationOp;

    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<Application>> {
        ctx.stores.applications.clone()
    }

    fn table(&self) -> &StateTable<ApplicationOp> {
        &self.table
    }

    async fn apply(&self, ctx: &Context, operation: ApplicationOp, app: &mut Application) -> Result<String> {
        match operation {
            ApplicationOp::Publish => self.publish(ctx, app).await,
            ApplicationOp::Update => {
                validate(app)?;
                Ok("应用已更新".to_string())
            }
            ApplicationOp::Delete => self.delete(ctx, app).await,
        }
    }

    fn merge(&self, mut ours: Application, started: &Application, latest: &Application) -> Application {
        merge_list(&mut ours.spec.apis, &started.spec.apis, &latest.spec.apis);
        if let (Some(status), Some(latest)) = (ours.status.as_mut(), latest.status.as_ref()) {
            status.called_count = latest.called_count;
        }
        if let Some(status) = ours.status.as_mut() {
            status.api_count = ours.spec.apis.len() as u64;
        }
        ours
    }
}

fn validate(app: &Application) -> Result<()> {
    if app.spec.owner.is_empty() {
        return Err(Error::Invalid(format!("应用 {} 未指定所有者", app.spec.name)));
    }
    if let Some(credential) = &app.spec.credential {
        if credential.key.is_empty() || credential.secret.is_empty() {
            return Err(Error::Invalid("应用凭证的 key 与 secret 不能为空".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apihub_common::{ApplicationSpec, Credential};

    fn app() -> Application {
        Application::new(
            "mobile",
            ApplicationSpec {
                name: "移动端".to_string(),
                owner: "alice".to_string(),
                credential: None,
                apis: vec!["orders".to_string()],
            },
        )
    }

    #[test]
    fn test_validate_credential() {
        let mut app = app();
        assert!(validate(&app).is_ok());
        app.spec.credential = Some(Credential {
            key: "k".to_string(),
            secret: String::new(),
        });
        assert!(validate(&app).is_err());
    }

    #[test]
    fn test_merge_takes_concurrent_bindings() {
        let handler = ApplicationHandler::new();
        let started = app();
        let mut ours = app();
        ours.status.get_or_insert_with(Default::default).consumer_id = Some("c-1".to_string());

        let mut latest = app();
        latest.spec.apis.push("users".to_string());
        latest.status.get_or_insert_with(Default::default).called_count = 42;

        let merged = handler.merge(ours, &started, &latest);
        assert_eq!(merged.spec.apis.len(), 2);
        let status = merged.status.unwrap();
        assert_eq!(status.consumer_id.as_deref(), Some("c-1"));
        assert_eq!(status.called_count, 42);
        assert_eq!(status.api_count, 2);
    }
}
