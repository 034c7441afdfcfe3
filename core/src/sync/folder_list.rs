//! Container discovery
//!
//! Reconciles the remote container list against local Container rows before
//! any mailbox sync runs: new remote containers are created (with a
//! detected role), containers that disappeared remotely are deleted. On
//! label-based providers, role-less containers become labels.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::connection::{Operation, OperationContext};
use crate::error::HeimdallResult;
use crate::folder::{Container, ContainerKind, ContainerRole};

pub struct FetchContainerListOperation;

#[async_trait]
impl Operation for FetchContainerListOperation {
    fn description(&self) -> String {
        "FetchContainerList".to_string()
    }

    async fn run(&mut self, ctx: &mut OperationContext<'_>) -> HeimdallResult<serde_json::Value> {
        let remote = ctx.session.list_containers().await?;
        let label_provider = ctx.session.capabilities().labels;
        let local = ctx.store.containers().await?;

        let mut discovered = 0;
        for info in remote.iter().filter(|info| info.is_selectable()) {
            if local.iter().any(|c| c.name == info.name) {
                continue;
            }
            let kind = if label_provider && ContainerRole::detect(&info.name) == ContainerRole::None
            {
                ContainerKind::Label
            } else {
                ContainerKind::Folder
            };
            let container = Container::new(ctx.store.account_id(), info.name.clone(), kind);
            info!(container = %container.name, role = ?container.role, kind = ?kind, "discovered container");
            ctx.store.save_container(&container).await?;
            discovered += 1;
        }

        let mut removed = 0;
        for container in &local {
            if !remote.iter().any(|info| info.name == container.name) {
                info!(container = %container.name, "container disappeared remotely");
                ctx.store.delete_container(container).await?;
                removed += 1;
            }
        }

        Ok(json!({"discovered": discovered, "removed": removed}))
    }
}
