//! 经由指令路由的注册驱动。

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::manager::CommandServiceManager;
use crate::backend::RegistryBackend;
use crate::error::BackendError;
use crate::listener::{CommandListener, ServiceListener};
use crate::registry::RegistryDriver;
use crate::url::ServiceUrl;

/// 为每个订阅客户端维护一个 [`CommandServiceManager`]，订阅与查询都经由它计算最终地址列表。
///
/// 注册、注销与可用性操作不涉及路由，直接落到注册中心。管理器只在订阅成功后保留；
/// 未订阅客户端的查询使用临时管理器，不留下任何分组订阅。
pub struct CommandDriver {
    backend: Arc<dyn RegistryBackend>,
    local_ip: String,
    managers: DashMap<String, Arc<CommandServiceManager>>,
}

impl CommandDriver {
    pub fn new(backend: Arc<dyn RegistryBackend>, local_ip: impl Into<String>) -> Self {
        Self {
            backend,
            local_ip: local_ip.into(),
            managers: DashMap::new(),
        }
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// 已存在的客户端管理器。
    pub fn manager(&self, client: &ServiceUrl) -> Option<Arc<CommandServiceManager>> {
        self.managers
            .get(&client.identity())
            .map(|manager| Arc::clone(manager.value()))
    }

    fn manager_for(&self, client: &ServiceUrl) -> Arc<CommandServiceManager> {
        let manager = self.managers.entry(client.identity()).or_insert_with(|| {
            CommandServiceManager::new(
                client.copy(),
                Arc::clone(&self.backend),
                self.local_ip.clone(),
            )
        });
        Arc::clone(manager.value())
    }

    /// 订阅失败时撤回本次加入的监听者；管理器不再有监听者时释放分组订阅并移除。
    ///
    /// 释放失败时保留管理器，重试订阅会复用它已登记的分组订阅。
    fn rollback(
        &self,
        client: &ServiceUrl,
        manager: &Arc<CommandServiceManager>,
        listener: &Arc<dyn ServiceListener>,
    ) {
        if manager.remove_listener(listener) > 0 {
            return;
        }
        if let Err(err) = manager.release() {
            warn!(
                client = %client.uri(),
                error = %err,
                "failed to release groups after subscribe failure"
            );
            return;
        }
        self.managers.remove_if(&client.identity(), |_, current| {
            Arc::ptr_eq(current, manager) && current.listener_count() == 0
        });
    }
}

impl RegistryDriver for CommandDriver {
    fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    fn do_subscribe(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError> {
        let manager = self.manager_for(url);
        manager.add_listener(Arc::clone(&listener));
        let subscribed = manager.subscribe_own_group().and_then(|()| {
            let as_command: Arc<dyn CommandListener> = manager.clone();
            self.backend.subscribe_command(url, as_command)
        });
        if subscribed.is_err() {
            self.rollback(url, &manager, &listener);
        }
        subscribed
    }

    fn do_unsubscribe(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError> {
        let Some(manager) = self.manager(url) else {
            return Ok(());
        };
        if manager.remove_listener(listener) > 0 {
            return Ok(());
        }
        let as_command: Arc<dyn CommandListener> = manager.clone();
        self.backend.unsubscribe_command(url, &as_command)?;
        manager.release()?;
        self.managers.remove(&url.identity());
        debug!(client = %url.uri(), "command manager released");
        Ok(())
    }

    fn do_discover(&self, url: &ServiceUrl) -> Result<Vec<ServiceUrl>, BackendError> {
        let command = self.backend.discover_command(url)?;
        let manager = self.manager(url).unwrap_or_else(|| {
            CommandServiceManager::detached(
                url.copy(),
                Arc::clone(&self.backend),
                self.local_ip.clone(),
            )
        });
        Ok(manager.discover(command.as_deref()))
    }

    fn close(&self) {
        self.managers.clear();
        self.backend.close();
    }
}
