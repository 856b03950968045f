//! 观察者契约：订阅方、注册中心驱动与指令路由之间的回调接口。
//!
//! # 教案式说明
//! - **意图（Why）**：订阅后“立即回放缓存”和“注册中心推送”两条路径必须调用同一个监听者契约，
//!   否则回放与推送的语义会逐渐分叉；因此 [`NotifyListener`] 只暴露两个稳定方法：
//!   [`NotifyListener::deliver_snapshot`]（回放本地已知快照）与 [`NotifyListener::deliver_update`]（实时变更）。
//! - **契约（What）**：两个方法收到的都是某个节点类型分区的**全量**列表，而不是增量 diff；
//!   默认实现中 `deliver_update` 直接转发到 `deliver_snapshot`，多数监听者只需实现一个方法。
//! - **身份（What）**：退订、失败队列都需要识别“同一个监听者”，[`ListenerHandle`] 以 `Arc` 指针地址作为身份，
//!   同一个 `Arc` 的任意克隆都视为同一监听者。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::url::ServiceUrl;

/// 订阅方监听者。
pub trait NotifyListener: Send + Sync {
    /// 投递一个节点类型分区的本地快照（订阅时的缓存回放、订阅失败时的陈旧缓存）。
    fn deliver_snapshot(&self, registry: &ServiceUrl, urls: &[ServiceUrl]);

    /// 投递注册中心推送后的最新全量列表。
    fn deliver_update(&self, registry: &ServiceUrl, urls: &[ServiceUrl]) {
        self.deliver_snapshot(registry, urls);
    }
}

/// 注册中心驱动推送“某订阅 URL 对应的提供方列表变化”。
pub trait ServiceListener: Send + Sync {
    fn notify_service(&self, subscription: &ServiceUrl, registry: &ServiceUrl, urls: &[ServiceUrl]);
}

/// 注册中心驱动推送“某订阅 URL 对应的路由指令变化”；`None` 表示指令被删除。
pub trait CommandListener: Send + Sync {
    fn notify_command(&self, subscription: &ServiceUrl, command: Option<&str>);
}

/// 以 `Arc` 数据指针地址作为身份键。
pub fn listener_key<T: ?Sized>(listener: &Arc<T>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// 可哈希、可比较的监听者句柄。
#[derive(Clone)]
pub struct ListenerHandle(Arc<dyn NotifyListener>);

impl ListenerHandle {
    pub fn new(listener: Arc<dyn NotifyListener>) -> Self {
        Self(listener)
    }

    pub fn key(&self) -> usize {
        listener_key(&self.0)
    }

    pub fn listener(&self) -> &Arc<dyn NotifyListener> {
        &self.0
    }
}

impl From<Arc<dyn NotifyListener>> for ListenerHandle {
    fn from(listener: Arc<dyn NotifyListener>) -> Self {
        Self(listener)
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ListenerHandle {}

impl Hash for ListenerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle({:#x})", self.key())
    }
}

/// 把最近一次投递记录下来的监听者，测试与模拟程序共用。
#[derive(Debug, Default)]
pub struct RecordingListener {
    deliveries: parking_lot::Mutex<Vec<Vec<ServiceUrl>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 最近一次收到的列表；从未收到时返回 `None`。
    pub fn last(&self) -> Option<Vec<ServiceUrl>> {
        self.deliveries.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn all(&self) -> Vec<Vec<ServiceUrl>> {
        self.deliveries.lock().clone()
    }
}

impl NotifyListener for RecordingListener {
    fn deliver_snapshot(&self, _registry: &ServiceUrl, urls: &[ServiceUrl]) {
        self.deliveries.lock().push(urls.to_vec());
    }
}
