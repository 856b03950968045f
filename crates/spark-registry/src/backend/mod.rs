//! 注册中心驱动契约。
//!
//! # 教案式说明
//! - **意图（Why）**：与注册中心的线协议（ZooKeeper watch、HTTP 长轮询等）不在本层范围内；
//!   本层只规定一个具体驱动必须满足的最小操作集合，上面的核心缓存、失败回退与指令路由都只依赖这组操作。
//! - **契约（What）**：
//!   - 提供方 URL 在注册中心上有“已注册但不可用”与“可用”两种状态，`register` 只写入前者，
//!     `available`/`unavailable` 在两者之间移动；`discover_service` 只返回可用条目；
//!   - 服务与指令的推送通过 [`ServiceListener`]/[`CommandListener`] 回调，回调线程归驱动所有，
//!     且驱动不得在持有内部锁时回调（上层可能在回调里再次访问驱动）；
//!   - 所有失败以 [`BackendError`] 返回，由上层决定重试或上抛。
//! - **实现（How）**：[`memory::MemoryRegistryCenter`] 是进程内实现，支持模拟注册中心宕机，
//!   用于单机模式、模拟程序与测试。

pub mod memory;

use std::sync::Arc;

use crate::error::BackendError;
use crate::listener::{CommandListener, ServiceListener};
use crate::url::ServiceUrl;

pub use memory::{MemoryCenterProvider, MemoryRegistryCenter};

/// 具体注册中心驱动需要实现的操作集合。
pub trait RegistryBackend: Send + Sync + 'static {
    /// 注册中心自身的地址。
    fn url(&self) -> &ServiceUrl;

    fn register(&self, url: &ServiceUrl) -> Result<(), BackendError>;

    fn unregister(&self, url: &ServiceUrl) -> Result<(), BackendError>;

    fn available(&self, url: &ServiceUrl) -> Result<(), BackendError>;

    fn unavailable(&self, url: &ServiceUrl) -> Result<(), BackendError>;

    fn subscribe_service(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError>;

    fn unsubscribe_service(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError>;

    fn subscribe_command(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn CommandListener>,
    ) -> Result<(), BackendError>;

    fn unsubscribe_command(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn CommandListener>,
    ) -> Result<(), BackendError>;

    /// 同步查询订阅 URL 对应分组与路径下的可用提供方。
    fn discover_service(&self, url: &ServiceUrl) -> Result<Vec<ServiceUrl>, BackendError>;

    /// 同步查询订阅 URL 所在分组的路由指令原文。
    fn discover_command(&self, url: &ServiceUrl) -> Result<Option<String>, BackendError>;

    /// 释放连接等资源；默认无操作。
    fn close(&self) {}
}

/// 按注册中心 URL 构造驱动，供 [`RegistryFactory`](crate::registry::RegistryFactory) 使用。
pub trait BackendProvider: Send + Sync + 'static {
    fn create(&self, registry_url: &ServiceUrl) -> Result<Arc<dyn RegistryBackend>, BackendError>;
}

