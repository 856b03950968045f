//! 进程内注册中心。
//!
//! # 教案式说明
//! - **意图（Why）**：单机部署、模拟程序与测试都需要一个行为与真实注册中心一致、但不依赖外部进程的实现；
//!   同时要能“拔网线”，验证失败回退与陈旧缓存路径。
//! - **数据布局（How）**：按 `(group, path)` 组织节点，每个节点记录 URL 与可用标记，对应 ZooKeeper 上
//!   “可用 / 不可用”两个目录；指令按分组保存。
//! - **契约（What）**：
//!   - [`MemoryRegistryCenter::set_online`] 为 `false` 时，所有驱动操作返回 [`BackendError::Unavailable`]，
//!     内部状态保持不变；
//!   - 变更推送在调用线程上同步执行，且在释放内部锁之后进行；
//!   - [`MemoryRegistryCenter::calls`] 记录每类操作的尝试次数（包含失败），供测试断言重试节奏。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{BackendProvider, RegistryBackend};
use crate::constants::NODE_TYPE_REFERER;
use crate::error::BackendError;
use crate::listener::{CommandListener, ServiceListener, listener_key};
use crate::url::ServiceUrl;

type ServiceKey = (String, String);

fn service_key(url: &ServiceUrl) -> ServiceKey {
    (url.group().to_owned(), url.path().to_owned())
}

#[derive(Clone, Debug)]
struct Node {
    url: ServiceUrl,
    available: bool,
}

struct ServiceWatch {
    subscription: ServiceUrl,
    listener: Arc<dyn ServiceListener>,
}

struct CommandWatch {
    subscription: ServiceUrl,
    listener: Arc<dyn CommandListener>,
}

#[derive(Default)]
struct CenterState {
    nodes: HashMap<ServiceKey, BTreeMap<String, Node>>,
    commands: HashMap<String, String>,
    service_watches: HashMap<ServiceKey, Vec<ServiceWatch>>,
    command_watches: HashMap<String, Vec<CommandWatch>>,
}

impl CenterState {
    fn providers(&self, key: &ServiceKey) -> Vec<ServiceUrl> {
        self.nodes
            .get(key)
            .map(|nodes| {
                nodes
                    .values()
                    .filter(|node| node.available && node.url.node_type() != NODE_TYPE_REFERER)
                    .map(|node| node.url.copy())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn service_targets(&self, key: &ServiceKey) -> Vec<(ServiceUrl, Arc<dyn ServiceListener>)> {
        self.service_watches
            .get(key)
            .map(|watches| {
                watches
                    .iter()
                    .map(|watch| (watch.subscription.copy(), Arc::clone(&watch.listener)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// 进程内注册中心实现。
pub struct MemoryRegistryCenter {
    url: ServiceUrl,
    online: AtomicBool,
    state: Mutex<CenterState>,
    calls: DashMap<&'static str, usize>,
}

impl MemoryRegistryCenter {
    pub fn new(url: ServiceUrl) -> Arc<Self> {
        Arc::new(Self {
            url,
            online: AtomicBool::new(true),
            state: Mutex::new(CenterState::default()),
            calls: DashMap::new(),
        })
    }

    /// 模拟注册中心恢复或宕机。
    pub fn set_online(&self, online: bool) {
        debug!(registry = %self.url, online, "memory registry connectivity changed");
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// 某类操作的累计尝试次数。
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map(|count| *count).unwrap_or(0)
    }

    /// 指定分组与路径下当前可用的提供方。
    pub fn providers(&self, group: &str, path: &str) -> Vec<ServiceUrl> {
        self.state
            .lock()
            .providers(&(group.to_owned(), path.to_owned()))
    }

    /// 指定分组与路径下所有注册条目及其可用标记。
    pub fn registrations(&self, group: &str, path: &str) -> Vec<(ServiceUrl, bool)> {
        self.state
            .lock()
            .nodes
            .get(&(group.to_owned(), path.to_owned()))
            .map(|nodes| {
                nodes
                    .values()
                    .map(|node| (node.url.copy(), node.available))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 当前订阅某分组与路径的监听者数量。
    pub fn service_watch_count(&self, group: &str, path: &str) -> usize {
        self.state
            .lock()
            .service_watches
            .get(&(group.to_owned(), path.to_owned()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 写入或删除某分组的路由指令，并推送给该分组的指令订阅者。
    pub fn set_command(&self, group: &str, command: Option<&str>) {
        let targets: Vec<(ServiceUrl, Arc<dyn CommandListener>)> = {
            let mut state = self.state.lock();
            match command {
                Some(text) => {
                    state.commands.insert(group.to_owned(), text.to_owned());
                }
                None => {
                    state.commands.remove(group);
                }
            }
            state
                .command_watches
                .get(group)
                .map(|watches| {
                    watches
                        .iter()
                        .map(|watch| (watch.subscription.copy(), Arc::clone(&watch.listener)))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (subscription, listener) in targets {
            listener.notify_command(&subscription, command);
        }
    }

    fn guard(&self, operation: &'static str) -> Result<(), BackendError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if self.is_online() {
            Ok(())
        } else {
            Err(BackendError::unavailable(format!(
                "{} is offline",
                self.url.address()
            )))
        }
    }

    /// 修改节点后推送最新可用列表；推送发生在锁外。
    fn mutate_and_push(&self, url: &ServiceUrl, mutate: impl FnOnce(&mut BTreeMap<String, Node>)) {
        let key = service_key(url);
        let (providers, targets) = {
            let mut state = self.state.lock();
            mutate(state.nodes.entry(key.clone()).or_default());
            (state.providers(&key), state.service_targets(&key))
        };
        for (subscription, listener) in targets {
            listener.notify_service(&subscription, &self.url, &providers);
        }
    }

    fn set_availability(&self, url: &ServiceUrl, available: bool) {
        self.mutate_and_push(url, |nodes| {
            nodes
                .entry(url.identity())
                .and_modify(|node| node.available = available)
                .or_insert_with(|| Node {
                    url: url.copy(),
                    available,
                });
        });
    }
}

impl RegistryBackend for MemoryRegistryCenter {
    fn url(&self) -> &ServiceUrl {
        &self.url
    }

    fn register(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.guard("register")?;
        self.mutate_and_push(url, |nodes| {
            nodes.insert(
                url.identity(),
                Node {
                    url: url.copy(),
                    available: false,
                },
            );
        });
        Ok(())
    }

    fn unregister(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.guard("unregister")?;
        self.mutate_and_push(url, |nodes| {
            nodes.remove(&url.identity());
        });
        Ok(())
    }

    fn available(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.guard("available")?;
        self.set_availability(url, true);
        Ok(())
    }

    fn unavailable(&self, url: &ServiceUrl) -> Result<(), BackendError> {
        self.guard("unavailable")?;
        self.set_availability(url, false);
        Ok(())
    }

    fn subscribe_service(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError> {
        self.guard("subscribe_service")?;
        let mut state = self.state.lock();
        let watches = state.service_watches.entry(service_key(url)).or_default();
        let key = listener_key(&listener);
        if !watches.iter().any(|watch| {
            listener_key(&watch.listener) == key && watch.subscription.identity() == url.identity()
        }) {
            watches.push(ServiceWatch {
                subscription: url.copy(),
                listener,
            });
        }
        Ok(())
    }

    fn unsubscribe_service(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn ServiceListener>,
    ) -> Result<(), BackendError> {
        self.guard("unsubscribe_service")?;
        let key = listener_key(listener);
        if let Some(watches) = self.state.lock().service_watches.get_mut(&service_key(url)) {
            watches.retain(|watch| {
                listener_key(&watch.listener) != key
                    || watch.subscription.identity() != url.identity()
            });
        }
        Ok(())
    }

    fn subscribe_command(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn CommandListener>,
    ) -> Result<(), BackendError> {
        self.guard("subscribe_command")?;
        let mut state = self.state.lock();
        let watches = state
            .command_watches
            .entry(url.group().to_owned())
            .or_default();
        let key = listener_key(&listener);
        if !watches.iter().any(|watch| {
            listener_key(&watch.listener) == key && watch.subscription.identity() == url.identity()
        }) {
            watches.push(CommandWatch {
                subscription: url.copy(),
                listener,
            });
        }
        Ok(())
    }

    fn unsubscribe_command(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn CommandListener>,
    ) -> Result<(), BackendError> {
        self.guard("unsubscribe_command")?;
        let key = listener_key(listener);
        if let Some(watches) = self.state.lock().command_watches.get_mut(url.group()) {
            watches.retain(|watch| {
                listener_key(&watch.listener) != key
                    || watch.subscription.identity() != url.identity()
            });
        }
        Ok(())
    }

    fn discover_service(&self, url: &ServiceUrl) -> Result<Vec<ServiceUrl>, BackendError> {
        self.guard("discover_service")?;
        Ok(self.state.lock().providers(&service_key(url)))
    }

    fn discover_command(&self, url: &ServiceUrl) -> Result<Option<String>, BackendError> {
        self.guard("discover_command")?;
        Ok(self.state.lock().commands.get(url.group()).cloned())
    }
}

/// 按注册中心地址复用 [`MemoryRegistryCenter`] 的驱动工厂。
///
/// 同一 `host:port` 的多次创建返回同一实例，测试可通过 [`MemoryCenterProvider::center`] 取回并注入故障。
#[derive(Default)]
pub struct MemoryCenterProvider {
    centers: DashMap<String, Arc<MemoryRegistryCenter>>,
}

impl MemoryCenterProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn center(&self, registry_url: &ServiceUrl) -> Option<Arc<MemoryRegistryCenter>> {
        self.centers
            .get(&registry_url.address())
            .map(|center| Arc::clone(center.value()))
    }

    pub fn get_or_create(&self, registry_url: &ServiceUrl) -> Arc<MemoryRegistryCenter> {
        let center = self
            .centers
            .entry(registry_url.address())
            .or_insert_with(|| MemoryRegistryCenter::new(registry_url.copy()));
        Arc::clone(center.value())
    }
}

impl BackendProvider for MemoryCenterProvider {
    fn create(&self, registry_url: &ServiceUrl) -> Result<Arc<dyn RegistryBackend>, BackendError> {
        let center: Arc<dyn RegistryBackend> = self.get_or_create(registry_url);
        Ok(center)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ServiceListener;

    #[derive(Default)]
    struct Capture {
        last: Mutex<Option<Vec<ServiceUrl>>>,
    }

    impl ServiceListener for Capture {
        fn notify_service(&self, _: &ServiceUrl, _: &ServiceUrl, urls: &[ServiceUrl]) {
            *self.last.lock() = Some(urls.to_vec());
        }
    }

    fn center() -> Arc<MemoryRegistryCenter> {
        MemoryRegistryCenter::new(ServiceUrl::new("memory", "127.0.0.1", 0, ""))
    }

    #[test]
    fn register_is_unavailable_until_marked_available() {
        let center = center();
        let url = ServiceUrl::new("infinity", "10.0.0.1", 1, "svc");
        center.register(&url).expect("注册应成功");
        assert!(center.discover_service(&url).expect("查询").is_empty());
        center.available(&url).expect("标记可用");
        assert_eq!(center.discover_service(&url).expect("查询"), vec![url]);
    }

    #[test]
    fn offline_center_rejects_and_counts_attempts() {
        let center = center();
        let url = ServiceUrl::new("infinity", "10.0.0.1", 1, "svc");
        center.set_online(false);
        assert!(matches!(
            center.register(&url),
            Err(BackendError::Unavailable { .. })
        ));
        assert_eq!(center.calls("register"), 1);
        assert!(center.registrations("default_rpc", "svc").is_empty());
    }

    #[test]
    fn watchers_receive_available_list() {
        let center = center();
        let capture = Arc::new(Capture::default());
        let subscription = ServiceUrl::new("infinity", "10.0.0.9", 0, "svc");
        let listener: Arc<dyn ServiceListener> = capture.clone();
        center
            .subscribe_service(&subscription, Arc::clone(&listener))
            .expect("订阅");
        center
            .subscribe_service(&subscription, listener)
            .expect("重复订阅应幂等");
        assert_eq!(center.service_watch_count("default_rpc", "svc"), 1);

        let provider = ServiceUrl::new("infinity", "10.0.0.1", 1, "svc");
        center.register(&provider).expect("注册");
        assert_eq!(capture.last.lock().clone(), Some(Vec::new()));
        center.available(&provider).expect("可用");
        assert_eq!(capture.last.lock().clone(), Some(vec![provider]));
    }
}
