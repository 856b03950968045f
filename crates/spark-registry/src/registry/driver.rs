//! `do_*` 接缝：[`RegistryCore`](super::RegistryCore) 与具体注册中心交互的唯一入口。
//!
//! # 教案式说明
//! - **意图（Why）**：核心层负责缓存、已注册集合与心跳开关，失败回退层负责排队重试；二者都不关心
//!   “订阅到底是直接落到注册中心，还是先经过指令路由”。把这一差异收敛到 [`RegistryDriver`]，
//!   上层组合方式就与是否启用指令路由无关。
//! - **实现（How）**：
//!   - [`ServiceDriver`]：直连驱动，订阅与查询原样转发到 [`RegistryBackend`]；
//!   - [`CommandDriver`](crate::command::CommandDriver)：订阅与查询经由每个客户端一个的指令路由管理器。
//! - **契约（What）**：所有方法以 [`BackendError`] 返回失败，不做任何重试与日志降级，这些决策属于上层。

use std::sync::Arc;

use crate::backend::RegistryBackend;
use crate::error::BackendError;
use crate::listener::ServiceListener;
use crate::url::ServiceUrl;

/// 核心层依赖的驱动操作集合。
pub trait RegistryDriver: Send + Sync + 'static {
    /// 底层注册中心驱动。
    fn backend(&self) -> &Arc<dyn RegistryBackend>;

    fn do_register(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.backend().register(url)
    }

    fn do_unregister(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.backend().unregister(url)
    }

    fn do_available(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.backend().available(url)
    }

    fn do_unavailable(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.backend().unavailable(url)
    }

    /// 为客户端 URL 建立订阅；`listener` 收到的是该客户端最终应使用的地址列表。
    fn do_subscribe(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError>;

    fn do_unsubscribe(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError>;

    /// 同步计算客户端 URL 当前应使用的地址列表。
    fn do_discover(&self, url: &ServiceUrl) -> Result<Vec<ServiceUrl>, BackendError>;

    fn close(&self) {
        self.backend().close();
    }
}

/// 不经过指令路由的直连驱动。
pub struct ServiceDriver {
    backend: Arc<dyn RegistryBackend>,
}

impl ServiceDriver {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }
}

impl RegistryDriver for ServiceDriver {
    fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    fn do_subscribe(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError> {
        self.backend.subscribe_service(url, listener)
    }

    fn do_unsubscribe(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError> {
        self.backend.unsubscribe_service(url, listener)
    }

    fn do_discover(&self, url: &ServiceUrl) -> Result<Vec<ServiceUrl>, BackendError> {
        self.backend.discover_service(url)
    }
}
