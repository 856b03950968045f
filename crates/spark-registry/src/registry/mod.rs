//! 注册层：核心缓存、失败回退、驱动接缝与注册实例工厂。
//!
//! # 教案式说明
//! - **分层（How）**：[`RegistryCore`] 持有本地状态并通过 [`RegistryDriver`] 访问注册中心；
//!   [`FailbackRegistry`] 包装核心，吞掉瞬时失败并交给 [`RetryScheduler`] 周期重试；
//!   [`RegistryFactory`] 按注册中心地址缓存组装好的实例，并持有心跳开关与唯一的重试线程。
//! - **契约（What）**：对外只暴露 [`Registry`] trait，调用方无需知道实例背后是否启用了指令路由。

pub mod core;
pub mod driver;
pub mod factory;
pub mod failback;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::listener::NotifyListener;
use crate::url::ServiceUrl;

pub use self::core::{RegistrationState, RegistryCore};
pub use driver::{RegistryDriver, ServiceDriver};
pub use factory::RegistryFactory;
pub use failback::{FailbackRegistry, RetryScheduler, RetryTask};

/// 某个订阅客户端的缓存快照，按节点类型分区。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub client: ServiceUrl,
    pub partitions: BTreeMap<String, Vec<ServiceUrl>>,
}

impl SubscriptionSnapshot {
    /// 指定节点类型分区的地址列表。
    pub fn partition(&self, node_type: &str) -> &[ServiceUrl] {
        self.partitions
            .get(node_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// 注册层对外契约。
///
/// # 契约说明（What）
/// - `register`/`unregister` 在失败回退模式下是“发出即返回”的：注册中心不可达时返回 `Ok(())` 并排队重试，
///   只有 URL 或注册中心声明 `check=true` 时才返回错误；
/// - `discover` 永不失败，最坏情况返回空列表；
/// - `available`/`unavailable` 只移动已注册条目的可用状态，不删除注册。
pub trait Registry: Send + Sync {
    /// 注册中心自身的地址。
    fn url(&self) -> &ServiceUrl;

    fn register(&self, url: &ServiceUrl) -> Result<(), RegistryError>;

    fn unregister(&self, url: &ServiceUrl) -> Result<(), RegistryError>;

    fn available(&self, url: &ServiceUrl) -> Result<(), RegistryError>;

    fn unavailable(&self, url: &ServiceUrl) -> Result<(), RegistryError>;

    fn subscribe(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError>;

    fn unsubscribe(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError>;

    fn discover(&self, url: &ServiceUrl) -> Vec<ServiceUrl>;

    /// 当前进程在该注册中心上的注册意图。
    fn registered_urls(&self) -> Vec<ServiceUrl>;

    /// 订阅缓存的只读投影。
    fn subscriptions(&self) -> Vec<SubscriptionSnapshot>;

    fn close(&self);
}
