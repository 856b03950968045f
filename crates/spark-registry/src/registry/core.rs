//! 注册核心：已注册集合、订阅缓存与心跳驱动的可用性状态机。
//!
//! # 教案式说明
//! - **意图（Why）**：注册中心会抖动、推送会延迟，调用方却需要“注册意图不丢、查询总有结果”。
//!   核心层把意图与最近一次已知拓扑保存在本地，再通过 [`RegistryDriver`] 与注册中心同步。
//! - **状态机（What）**：每个已注册 URL 处于 [`RegistrationState`] 之一：
//!   `Registered`（已写入，未对外可用）→ `Available`（心跳开关打开后）；显式调用 `unavailable`
//!   进入 `Unavailable`，此后心跳开关的批量扫描不会再把它标记为可用；`unregister` 从任何状态移除条目。
//! - **缓存（What）**：订阅缓存按“客户端身份 → 节点类型 → 地址列表”组织，每次推送按节点类型覆盖写入；
//!   [`Registry::discover`] 优先返回缓存，缓存为空时才同步查询注册中心，任何失败都降级为空列表。
//! - **并发（How）**：全部共享状态存放在 `DashMap` 中；调用驱动前先释放分片锁，
//!   因为驱动可能在同一线程内同步回调 [`RegistryCore::notify`]。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::driver::RegistryDriver;
use super::{Registry, SubscriptionSnapshot};
use crate::constants::{NODE_TYPE_SERVICE, REGISTRY_INTERNAL_KEYS};
use crate::error::{BackendError, RegistryError, RegistryOperation};
use crate::listener::{NotifyListener, ServiceListener, listener_key};
use crate::switch::{HeartbeatSwitch, SwitchListener};
use crate::url::ServiceUrl;

/// 已注册 URL 的本地状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RegistrationState {
    Registered,
    Available,
    /// 通过 `unavailable` 显式摘除，心跳扫描不会改变该状态。
    Unavailable,
}

#[derive(Debug)]
struct Registration {
    url: ServiceUrl,
    state: RegistrationState,
}

#[derive(Debug)]
struct SubscriptionCache {
    client: ServiceUrl,
    partitions: BTreeMap<String, Vec<ServiceUrl>>,
}

/// 把驱动推送写入缓存后再转交给订阅方的监听者。
struct CachingListener {
    core: Weak<RegistryCore>,
    client: ServiceUrl,
    listener: Arc<dyn NotifyListener>,
}

impl ServiceListener for CachingListener {
    fn notify_service(&self, _subscription: &ServiceUrl, _registry: &ServiceUrl, urls: &[ServiceUrl]) {
        if let Some(core) = self.core.upgrade() {
            core.notify(&self.client, &self.listener, urls);
        }
    }
}

/// 复制 URL 并剥离注册中心内部参数。
fn submitted_form(url: &ServiceUrl) -> ServiceUrl {
    let mut copy = url.copy();
    for key in REGISTRY_INTERNAL_KEYS {
        copy.remove_parameter(key);
    }
    copy
}

/// 注册核心。
pub struct RegistryCore {
    url: ServiceUrl,
    driver: Arc<dyn RegistryDriver>,
    switch: Arc<HeartbeatSwitch>,
    this: Weak<RegistryCore>,
    registered: DashMap<String, Registration>,
    subscribed: DashMap<String, SubscriptionCache>,
    listeners: DashMap<(String, usize), Arc<CachingListener>>,
    closed: AtomicBool,
}

impl RegistryCore {
    /// 构造核心并登记到心跳开关。
    pub fn new(driver: Arc<dyn RegistryDriver>, switch: Arc<HeartbeatSwitch>) -> Arc<Self> {
        let url = driver.backend().url().copy();
        let core = Arc::new_cyclic(|this| Self {
            url,
            driver,
            switch: Arc::clone(&switch),
            this: this.clone(),
            registered: DashMap::new(),
            subscribed: DashMap::new(),
            listeners: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let weak: Weak<dyn SwitchListener> = Arc::downgrade(&core) as Weak<dyn SwitchListener>;
        switch.watch(weak);
        core
    }

    pub fn switch(&self) -> &Arc<HeartbeatSwitch> {
        &self.switch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 已注册 URL 的本地状态；未注册时返回 `None`。
    pub fn registration_state(&self, url: &ServiceUrl) -> Option<RegistrationState> {
        self.registered
            .get(&submitted_form(url).identity())
            .map(|entry| entry.state)
    }

    /// 撤销本地注册意图，不访问注册中心；`check=true` 的注册失败时由失败回退层调用。
    pub fn forget(&self, url: &ServiceUrl) {
        self.registered.remove(&submitted_form(url).identity());
    }

    /// 某客户端当前缓存的全部地址，按节点类型顺序拼接。
    pub fn cached_urls(&self, client: &ServiceUrl) -> Vec<ServiceUrl> {
        self.subscribed
            .get(&client.identity())
            .map(|cache| cache.partitions.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// 用本地缓存回放一次快照，返回是否投递了任何数据。
    pub fn replay_cached(&self, client: &ServiceUrl, listener: &Arc<dyn NotifyListener>) -> bool {
        let partitions: Vec<Vec<ServiceUrl>> = self
            .subscribed
            .get(&client.identity())
            .map(|cache| {
                cache
                    .partitions
                    .values()
                    .filter(|urls| !urls.is_empty())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for urls in &partitions {
            listener.deliver_snapshot(&self.url, urls);
        }
        !partitions.is_empty()
    }

    /// 处理一次推送：按节点类型分区、覆盖缓存，再按分区逐个通知监听者。
    ///
    /// 空列表视为 `service` 分区被清空，监听者仍会收到一次空列表。
    pub fn notify(
        &self,
        client: &ServiceUrl,
        listener: &Arc<dyn NotifyListener>,
        urls: &[ServiceUrl],
    ) {
        let mut partitions: BTreeMap<String, Vec<ServiceUrl>> = BTreeMap::new();
        for url in urls {
            partitions
                .entry(url.node_type().to_owned())
                .or_default()
                .push(url.copy());
        }
        if partitions.is_empty() {
            partitions.insert(NODE_TYPE_SERVICE.to_owned(), Vec::new());
        }

        {
            let mut cache = self
                .subscribed
                .entry(client.identity())
                .or_insert_with(|| SubscriptionCache {
                    client: client.copy(),
                    partitions: BTreeMap::new(),
                });
            for (node_type, list) in &partitions {
                cache.partitions.insert(node_type.clone(), list.clone());
            }
        }

        debug!(
            registry = %self.url.uri(),
            client = %client.uri(),
            size = urls.len(),
            "subscription notified"
        );
        for list in partitions.values() {
            listener.deliver_update(&self.url, list);
        }
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::Closed {
                registry: self.url.uri(),
            });
        }
        Ok(())
    }

    fn backend_error(
        &self,
        operation: RegistryOperation,
        url: &ServiceUrl,
        source: BackendError,
    ) -> RegistryError {
        RegistryError::Backend {
            operation,
            registry: self.url.uri(),
            url: url.to_full_string(),
            source,
        }
    }

    /// 取得或创建缓存监听者，第二个返回值表示是否为本次新建。
    fn caching_listener(
        &self,
        client: &ServiceUrl,
        listener: &Arc<dyn NotifyListener>,
    ) -> (Arc<CachingListener>, bool) {
        let key = (client.identity(), listener_key(listener));
        let mut created = false;
        let entry = self.listeners.entry(key).or_insert_with(|| {
            created = true;
            Arc::new(CachingListener {
                core: self.this.clone(),
                client: client.copy(),
                listener: Arc::clone(listener),
            })
        });
        (Arc::clone(entry.value()), created)
    }

    fn set_state(&self, identity: &str, state: RegistrationState) {
        if let Some(mut entry) = self.registered.get_mut(identity) {
            entry.state = state;
        }
    }

    /// 心跳开关翻转后的批量扫描。
    fn sweep(&self, on: bool) {
        if self.is_closed() {
            return;
        }
        let (from, to) = if on {
            (RegistrationState::Registered, RegistrationState::Available)
        } else {
            (RegistrationState::Available, RegistrationState::Registered)
        };
        let targets: Vec<ServiceUrl> = self
            .registered
            .iter()
            .filter(|entry| entry.state == from)
            .map(|entry| entry.url.copy())
            .collect();

        for url in targets {
            let result = if on {
                self.driver.do_available(&url)
            } else {
                self.driver.do_unavailable(&url)
            };
            match result {
                Ok(()) => {
                    let identity = url.identity();
                    if let Some(mut entry) = self.registered.get_mut(&identity) {
                        if entry.state == from {
                            entry.state = to;
                        }
                    }
                }
                Err(err) => warn!(
                    registry = %self.url.uri(),
                    url = %url,
                    on,
                    error = %err,
                    "heartbeat sweep failed"
                ),
            }
        }
    }
}

impl SwitchListener for RegistryCore {
    fn on_switch(&self, on: bool) {
        self.sweep(on);
    }
}

impl Registry for RegistryCore {
    fn url(&self) -> &ServiceUrl {
        &self.url
    }

    fn register(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let submitted = submitted_form(url);
        let identity = submitted.identity();
        // 注册意图先于驱动调用写入，驱动失败时仍保留，由失败回退层决定是否撤销。
        self.registered
            .entry(identity.clone())
            .and_modify(|entry| entry.url = submitted.copy())
            .or_insert_with(|| Registration {
                url: submitted.copy(),
                state: RegistrationState::Registered,
            });

        self.driver
            .do_register(&submitted)
            .map_err(|source| self.backend_error(RegistryOperation::Register, &submitted, source))?;

        let explicit = self.registration_state(&submitted) == Some(RegistrationState::Unavailable);
        if !explicit {
            self.set_state(&identity, RegistrationState::Registered);
            if self.switch.is_on() {
                self.driver.do_available(&submitted).map_err(|source| {
                    self.backend_error(RegistryOperation::Available, &submitted, source)
                })?;
                self.set_state(&identity, RegistrationState::Available);
            }
        }
        info!(registry = %self.url.uri(), url = %submitted, "url registered");
        Ok(())
    }

    fn unregister(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let submitted = submitted_form(url);
        self.registered.remove(&submitted.identity());
        self.driver
            .do_unregister(&submitted)
            .map_err(|source| self.backend_error(RegistryOperation::Unregister, &submitted, source))?;
        info!(registry = %self.url.uri(), url = %submitted, "url unregistered");
        Ok(())
    }

    fn available(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let submitted = submitted_form(url);
        self.driver
            .do_available(&submitted)
            .map_err(|source| self.backend_error(RegistryOperation::Available, &submitted, source))?;
        self.set_state(&submitted.identity(), RegistrationState::Available);
        Ok(())
    }

    fn unavailable(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let submitted = submitted_form(url);
        self.driver.do_unavailable(&submitted).map_err(|source| {
            self.backend_error(RegistryOperation::Unavailable, &submitted, source)
        })?;
        self.set_state(&submitted.identity(), RegistrationState::Unavailable);
        Ok(())
    }

    fn subscribe(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let client = url.copy();
        let (caching, created) = self.caching_listener(&client, &listener);
        if let Err(source) = self.driver.do_subscribe(&client, caching) {
            if created {
                self.listeners
                    .remove(&(client.identity(), listener_key(&listener)));
            }
            return Err(self.backend_error(RegistryOperation::Subscribe, &client, source));
        }

        match self.driver.do_discover(&client) {
            Ok(urls) if !urls.is_empty() => self.notify(&client, &listener, &urls),
            Ok(_) => {
                self.replay_cached(&client, &listener);
            }
            Err(err) => {
                warn!(
                    registry = %self.url.uri(),
                    url = %client,
                    error = %err,
                    "initial discovery after subscribe failed"
                );
                self.replay_cached(&client, &listener);
            }
        }
        debug!(
            registry = %self.url.uri(),
            url = %client,
            listener = listener_key(&listener),
            "subscribed"
        );
        Ok(())
    }

    fn unsubscribe(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let key = (url.identity(), listener_key(listener));
        let Some(caching) = self
            .listeners
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(url = %url, "unsubscribe ignored: listener was never subscribed");
            return Ok(());
        };
        let caching: Arc<dyn ServiceListener> = caching;
        self.driver
            .do_unsubscribe(url, &caching)
            .map_err(|source| self.backend_error(RegistryOperation::Unsubscribe, url, source))?;
        self.listeners.remove(&key);
        Ok(())
    }

    fn discover(&self, url: &ServiceUrl) -> Vec<ServiceUrl> {
        if self.is_closed() {
            return Vec::new();
        }
        let cached = self.cached_urls(url);
        if !cached.is_empty() {
            return cached;
        }
        match self.driver.do_discover(url) {
            Ok(urls) => urls,
            Err(err) => {
                warn!(
                    registry = %self.url.uri(),
                    url = %url,
                    error = %err,
                    "discover failed, returning empty result"
                );
                Vec::new()
            }
        }
    }

    fn registered_urls(&self) -> Vec<ServiceUrl> {
        self.registered
            .iter()
            .map(|entry| entry.url.copy())
            .collect()
    }

    fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.subscribed
            .iter()
            .map(|cache| SubscriptionSnapshot {
                client: cache.client.copy(),
                partitions: cache.partitions.clone(),
            })
            .collect()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listeners.clear();
        self.driver.close();
        info!(registry = %self.url.uri(), "registry closed");
    }
}
