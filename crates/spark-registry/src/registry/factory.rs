//! 注册实例工厂。
//!
//! # 教案式说明
//! - **意图（Why）**：同一注册中心地址在进程内只应有一个注册实例，否则已注册集合与失败队列会被拆散；
//!   心跳开关与重试线程同样是进程级资源。工厂把三者收拢为一个长生命周期对象的字段，
//!   测试可以各自构造互不干扰的工厂。
//! - **契约（What）**：
//!   - [`RegistryFactory::get_registry`] 以注册中心 URL 的 `uri()` 为键创建或复用实例；
//!   - [`RegistryFactory::lookup`] 只读，不创建；
//!   - [`RegistryFactory::destroy_all`] 关闭并移除全部实例；[`RegistryFactory::shutdown`] 另外停止重试线程。
//! - **组装（How）**：注册中心 URL 参数覆盖工厂默认配置；`command=false` 时使用直连驱动，
//!   否则使用指令路由驱动。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use super::core::RegistryCore;
use super::driver::{RegistryDriver, ServiceDriver};
use super::failback::{FailbackRegistry, RetryScheduler, RetryTask};
use super::Registry;
use crate::backend::BackendProvider;
use crate::command::CommandDriver;
use crate::config::RegistryConfig;
use crate::error::{BackendError, RegistryError, RegistryOperation};
use crate::switch::HeartbeatSwitch;
use crate::url::ServiceUrl;

/// 注册实例工厂。
pub struct RegistryFactory {
    provider: Arc<dyn BackendProvider>,
    defaults: RegistryConfig,
    switch: Arc<HeartbeatSwitch>,
    scheduler: RetryScheduler,
    registries: Mutex<HashMap<String, Arc<FailbackRegistry>>>,
}

impl RegistryFactory {
    pub fn new(provider: Arc<dyn BackendProvider>, defaults: RegistryConfig) -> Self {
        Self {
            provider,
            defaults,
            switch: Arc::new(HeartbeatSwitch::new()),
            scheduler: RetryScheduler::start(),
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn switch(&self) -> &Arc<HeartbeatSwitch> {
        &self.switch
    }

    pub fn defaults(&self) -> &RegistryConfig {
        &self.defaults
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// 创建或复用注册实例。
    pub fn get_registry(&self, registry_url: &ServiceUrl) -> Result<Arc<FailbackRegistry>, RegistryError> {
        let key = registry_url.uri();
        let mut registries = self.registries.lock();
        if let Some(registry) = registries.get(&key) {
            return Ok(Arc::clone(registry));
        }

        let config = self
            .defaults
            .overlay_url(registry_url)
            .map_err(|err| connect_error(registry_url, BackendError::Rejected { detail: err.to_string() }))?;
        let backend = self
            .provider
            .create(registry_url)
            .map_err(|source| connect_error(registry_url, source))?;
        let driver: Arc<dyn RegistryDriver> = if config.command_enabled {
            let local_ip = config.resolve_local_ip(registry_url);
            Arc::new(CommandDriver::new(backend, local_ip))
        } else {
            Arc::new(ServiceDriver::new(backend))
        };
        let core = RegistryCore::new(driver, Arc::clone(&self.switch));
        let registry = FailbackRegistry::new(core, config.check, config.retry_period());
        let task: Weak<dyn RetryTask> = Arc::downgrade(&registry) as Weak<dyn RetryTask>;
        self.scheduler.schedule(task, config.retry_period());

        info!(
            registry = %key,
            command = config.command_enabled,
            check = config.check,
            retry_period_ms = config.retry_period_ms,
            "registry created"
        );
        registries.insert(key, Arc::clone(&registry));
        Ok(registry)
    }

    /// 查找已存在的注册实例。
    pub fn lookup(&self, registry_url: &ServiceUrl) -> Option<Arc<FailbackRegistry>> {
        self.registries.lock().get(&registry_url.uri()).cloned()
    }

    pub fn registries(&self) -> Vec<Arc<FailbackRegistry>> {
        self.registries.lock().values().cloned().collect()
    }

    /// 关闭并移除全部注册实例。
    pub fn destroy_all(&self) {
        let drained: Vec<Arc<FailbackRegistry>> =
            self.registries.lock().drain().map(|(_, registry)| registry).collect();
        for registry in drained {
            registry.close();
        }
    }

    /// 关闭全部注册实例并停止重试线程。
    pub fn shutdown(&self) {
        self.destroy_all();
        self.scheduler.stop();
    }
}

impl Drop for RegistryFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_error(registry_url: &ServiceUrl, source: BackendError) -> RegistryError {
    RegistryError::Backend {
        operation: RegistryOperation::Connect,
        registry: registry_url.uri(),
        url: registry_url.to_full_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCenterProvider;

    fn factory() -> (Arc<MemoryCenterProvider>, RegistryFactory) {
        let provider = MemoryCenterProvider::new();
        let factory = RegistryFactory::new(provider.clone(), RegistryConfig::default());
        (provider, factory)
    }

    #[test]
    fn registries_are_cached_by_uri() {
        let (_provider, factory) = factory();
        let url = ServiceUrl::parse("memory://127.0.0.1:2181").expect("解析");
        assert!(factory.lookup(&url).is_none());
        let first = factory.get_registry(&url).expect("创建");
        let second = factory
            .get_registry(&url.copy().with_parameter("retryPeriod", "10"))
            .expect("复用");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(factory.lookup(&url).is_some());
        assert_eq!(factory.scheduler().task_count(), 1);
    }

    #[test]
    fn url_parameters_shape_the_registry() {
        let (_provider, factory) = factory();
        let url = ServiceUrl::parse("memory://127.0.0.1:2181?retryPeriod=250&localIp=1.1.1.5")
            .expect("解析");
        let registry = factory.get_registry(&url).expect("创建");
        assert_eq!(registry.retry_period(), std::time::Duration::from_millis(250));
    }

    #[test]
    fn invalid_parameters_fail_creation() {
        let (_provider, factory) = factory();
        let url = ServiceUrl::parse("memory://127.0.0.1:2181?check=maybe").expect("解析");
        let err = factory.get_registry(&url).expect_err("非法参数应报错");
        assert_eq!(err.operation(), Some(RegistryOperation::Connect));
    }

    #[test]
    fn destroy_all_closes_registries() {
        let (_provider, factory) = factory();
        let url = ServiceUrl::parse("memory://127.0.0.1:2181").expect("解析");
        let registry = factory.get_registry(&url).expect("创建");
        factory.destroy_all();
        assert!(factory.lookup(&url).is_none());
        assert!(registry.core().is_closed());
        factory.shutdown();
        assert!(!factory.scheduler().is_running());
    }
}
