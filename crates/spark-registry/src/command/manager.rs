//! 单个客户端的指令路由状态机。
//!
//! # 教案式说明
//! - **意图（Why）**：同一个消费方订阅可能需要合并多个分组的提供方，并按本机 IP 做定向路由；
//!   这些分组的列表各自独立推送，指令本身也会随时变化。管理器把“分组缓存 + 当前指令”收敛为
//!   客户端最终应使用的一份地址列表，任何一侧变化都整体重算并通知全部监听者。
//! - **计算规则（What）**：
//!   1. 无指令（或指令无法解析）时只使用本分组；
//!   2. 按 `index` 顺序取第一个匹配服务路径的条目，后续条目忽略；
//!   3. 条目没有合并分组时使用本分组；有合并分组时按权重拼接各分组列表，分组数大于一时在最前面
//!      插入一条 `rule://` 权重伪 URL；任一权重非法时整条作废，回落到本分组；
//!   4. 依次应用路由规则，非法规则记录日志后跳过；
//!   5. 指令变化后不再被引用的合并分组从缓存中移除并取消订阅，之后到达的该分组推送直接丢弃；
//!      本分组的订阅属于客户端订阅本身，只在 [`CommandServiceManager::release`] 时取消。
//! - **临时计算（What）**：[`CommandServiceManager::detached`] 构造的管理器只做同步查询，
//!   不向注册中心登记任何分组订阅，供未订阅客户端的一次性查询使用。
//! - **并发（How）**：`serial` 是可重入锁，串行化同一客户端的全部重算；注册中心在重算过程中
//!   同步回调本管理器时由同一线程重入，不会死锁。`state` 是短临界区互斥锁，任何对注册中心或
//!   监听者的调用都发生在它之外。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use super::model::RoutingCommand;
use super::rule::{RouteRule, format_weights, parse_weights};
use crate::backend::RegistryBackend;
use crate::constants::{RULE_PROTOCOL, WEIGHTS_KEY};
use crate::error::BackendError;
use crate::listener::{CommandListener, ServiceListener, listener_key};
use crate::url::ServiceUrl;

#[derive(Default)]
struct ManagerState {
    listeners: Vec<Arc<dyn ServiceListener>>,
    /// 分组 → 最近一次已知的原始提供方列表。
    groups: HashMap<String, Vec<ServiceUrl>>,
    /// 已向注册中心订阅的分组。
    watched: HashSet<String>,
    command_text: Option<String>,
    command: Option<RoutingCommand>,
}

/// 一次计算的结果：地址列表与计算中引用到的分组。
struct Outcome {
    urls: Vec<ServiceUrl>,
    groups: BTreeSet<String>,
}

/// 客户端级指令路由管理器。
pub struct CommandServiceManager {
    client: ServiceUrl,
    backend: Arc<dyn RegistryBackend>,
    local_ip: String,
    watching: bool,
    this: Weak<CommandServiceManager>,
    serial: ReentrantMutex<()>,
    state: Mutex<ManagerState>,
}

impl CommandServiceManager {
    pub fn new(client: ServiceUrl, backend: Arc<dyn RegistryBackend>, local_ip: String) -> Arc<Self> {
        Self::build(client, backend, local_ip, true)
    }

    /// 不订阅任何分组的临时管理器，只用于一次性查询。
    pub fn detached(
        client: ServiceUrl,
        backend: Arc<dyn RegistryBackend>,
        local_ip: String,
    ) -> Arc<Self> {
        Self::build(client, backend, local_ip, false)
    }

    fn build(
        client: ServiceUrl,
        backend: Arc<dyn RegistryBackend>,
        local_ip: String,
        watching: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            client,
            backend,
            local_ip,
            watching,
            this: this.clone(),
            serial: ReentrantMutex::new(()),
            state: Mutex::new(ManagerState::default()),
        })
    }

    pub fn client(&self) -> &ServiceUrl {
        &self.client
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        let _serial = self.serial.lock();
        let mut state = self.state.lock();
        let key = listener_key(&listener);
        if !state.listeners.iter().any(|existing| listener_key(existing) == key) {
            state.listeners.push(listener);
        }
    }

    /// 移除监听者，返回剩余数量。
    pub fn remove_listener(&self, listener: &Arc<dyn ServiceListener>) -> usize {
        let _serial = self.serial.lock();
        let mut state = self.state.lock();
        let key = listener_key(listener);
        state.listeners.retain(|existing| listener_key(existing) != key);
        state.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// 当前缓存的分组，按名称排序。
    pub fn cached_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.state.lock().groups.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// 最近一次生效的指令原文。
    pub fn command_text(&self) -> Option<String> {
        self.state.lock().command_text.clone()
    }

    /// 订阅本分组的原始推送。
    pub fn subscribe_own_group(&self) -> Result<(), BackendError> {
        let _serial = self.serial.lock();
        self.watch_group(self.client.group())
    }

    /// 以给定指令原文计算当前地址列表，同时刷新指令缓存与分组缓存；不通知监听者。
    pub fn discover(&self, command_text: Option<&str>) -> Vec<ServiceUrl> {
        let _serial = self.serial.lock();
        self.apply_command(normalize(command_text))
    }

    /// 取消本管理器持有的全部分组订阅并清空缓存。
    pub fn release(&self) -> Result<(), BackendError> {
        let _serial = self.serial.lock();
        let watched: Vec<String> = {
            let mut state = self.state.lock();
            state.groups.clear();
            state.watched.drain().collect()
        };
        let mut result = Ok(());
        for group in watched {
            if let Err(err) = self.unwatch_group(&group) {
                self.state.lock().watched.insert(group);
                result = Err(err);
            }
        }
        result
    }

    fn as_service_listener(&self) -> Option<Arc<dyn ServiceListener>> {
        let this = self.this.upgrade()?;
        Some(this)
    }

    /// 先登记到 `watched` 再订阅：注册中心在订阅过程中同步推送时，推送不会被当作过期数据丢弃。
    fn watch_group(&self, group: &str) -> Result<(), BackendError> {
        if !self.watching {
            return Ok(());
        }
        let Some(listener) = self.as_service_listener() else {
            return Ok(());
        };
        if !self.state.lock().watched.insert(group.to_owned()) {
            return Ok(());
        }
        let subscribed = self
            .backend
            .subscribe_service(&self.client.copy_with_group(group), listener);
        if subscribed.is_err() {
            self.state.lock().watched.remove(group);
        }
        subscribed
    }

    fn unwatch_group(&self, group: &str) -> Result<(), BackendError> {
        let Some(listener) = self.as_service_listener() else {
            return Ok(());
        };
        self.backend
            .unsubscribe_service(&self.client.copy_with_group(group), &listener)
    }

    /// 取分组列表：命中缓存直接返回，否则订阅并同步查询后写入缓存。
    fn group_urls(&self, group: &str) -> Vec<ServiceUrl> {
        if let Some(urls) = self.state.lock().groups.get(group) {
            return urls.clone();
        }
        if let Err(err) = self.watch_group(group) {
            warn!(client = %self.client.uri(), group, error = %err, "failed to subscribe merged group");
            return Vec::new();
        }
        let urls = match self.backend.discover_service(&self.client.copy_with_group(group)) {
            Ok(urls) => urls,
            Err(err) => {
                warn!(client = %self.client.uri(), group, error = %err, "failed to discover merged group");
                Vec::new()
            }
        };
        self.state
            .lock()
            .groups
            .entry(group.to_owned())
            .or_insert_with(|| urls.clone());
        urls
    }

    fn baseline(&self) -> Outcome {
        let own = self.client.group().to_owned();
        Outcome {
            urls: self.group_urls(&own),
            groups: BTreeSet::from([own]),
        }
    }

    fn compute(&self, command: Option<&RoutingCommand>) -> Outcome {
        let Some(command) = command else {
            return self.baseline();
        };
        let Some(entry) = command.first_match(self.client.path()) else {
            return self.baseline();
        };

        let mut outcome = if entry.merge_groups.is_empty() {
            self.baseline()
        } else {
            match parse_weights(&entry.merge_groups) {
                Ok(weights) => {
                    let mut urls = Vec::new();
                    if weights.len() > 1 {
                        urls.push(
                            ServiceUrl::new(RULE_PROTOCOL, &self.local_ip, 0, self.client.path())
                                .with_parameter(WEIGHTS_KEY, format_weights(&weights)),
                        );
                    }
                    let mut groups = BTreeSet::new();
                    for weight in &weights {
                        urls.extend(self.group_urls(&weight.group));
                        groups.insert(weight.group.clone());
                    }
                    Outcome { urls, groups }
                }
                Err(err) => {
                    warn!(
                        client = %self.client.uri(),
                        pattern = %entry.pattern,
                        error = %err,
                        code = err.code(),
                        "command entry rejected, falling back to own group"
                    );
                    return self.baseline();
                }
            }
        };

        for raw in &entry.route_rules {
            match RouteRule::parse(raw) {
                Ok(rule) => rule.apply(&self.local_ip, &mut outcome.urls),
                Err(err) => warn!(
                    client = %self.client.uri(),
                    rule = %raw,
                    error = %err,
                    "route rule ignored"
                ),
            }
        }
        outcome
    }

    fn apply_command(&self, text: Option<&str>) -> Vec<ServiceUrl> {
        let command = text.and_then(|text| match RoutingCommand::parse(text) {
            Ok(command) => Some(command),
            Err(err) => {
                warn!(
                    client = %self.client.uri(),
                    error = %err,
                    code = err.code(),
                    "routing command ignored"
                );
                None
            }
        });
        let outcome = self.compute(command.as_ref());
        self.evict_unreferenced(&outcome.groups);
        {
            let mut state = self.state.lock();
            state.command_text = text.map(str::to_owned);
            state.command = command;
        }
        outcome.urls
    }

    fn evict_unreferenced(&self, referenced: &BTreeSet<String>) {
        let own = self.client.group();
        let evicted: Vec<String> = {
            let mut state = self.state.lock();
            let stale: BTreeSet<String> = state
                .groups
                .keys()
                .chain(state.watched.iter())
                .filter(|group| group.as_str() != own && !referenced.contains(*group))
                .cloned()
                .collect();
            for group in &stale {
                state.groups.remove(group);
                state.watched.remove(group);
            }
            stale.into_iter().collect()
        };
        for group in evicted {
            info!(client = %self.client.uri(), group = %group, "merged group evicted");
            if let Err(err) = self.unwatch_group(&group) {
                warn!(client = %self.client.uri(), group = %group, error = %err, "failed to unsubscribe evicted group");
            }
        }
    }

    fn notify_listeners(&self, urls: &[ServiceUrl]) {
        let listeners = self.state.lock().listeners.clone();
        for listener in listeners {
            listener.notify_service(&self.client, self.backend.url(), urls);
        }
    }
}

impl ServiceListener for CommandServiceManager {
    fn notify_service(&self, subscription: &ServiceUrl, _registry: &ServiceUrl, urls: &[ServiceUrl]) {
        let _serial = self.serial.lock();
        let group = subscription.group();
        let command = {
            let mut state = self.state.lock();
            if !state.watched.contains(group) {
                debug!(client = %self.client.uri(), group, "push for unwatched group dropped");
                return;
            }
            state.groups.insert(group.to_owned(), urls.to_vec());
            state.command.clone()
        };
        let outcome = self.compute(command.as_ref());
        self.notify_listeners(&outcome.urls);
    }
}

impl CommandListener for CommandServiceManager {
    fn notify_command(&self, _subscription: &ServiceUrl, command: Option<&str>) {
        let _serial = self.serial.lock();
        let text = normalize(command);
        if self.state.lock().command_text.as_deref() == text {
            debug!(client = %self.client.uri(), "routing command unchanged");
            return;
        }
        info!(client = %self.client.uri(), command = ?text, "routing command changed");
        let urls = self.apply_command(text);
        self.notify_listeners(&urls);
    }
}

fn normalize(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryRegistryCenter;
    use crate::constants::GROUP_KEY;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Capture {
        last: Mutex<Option<Vec<ServiceUrl>>>,
        count: Mutex<usize>,
    }

    impl ServiceListener for Capture {
        fn notify_service(&self, _: &ServiceUrl, _: &ServiceUrl, urls: &[ServiceUrl]) {
            *self.last.lock() = Some(urls.to_vec());
            *self.count.lock() += 1;
        }
    }

    fn center() -> Arc<MemoryRegistryCenter> {
        MemoryRegistryCenter::new(ServiceUrl::new("memory", "127.0.0.1", 0, ""))
    }

    fn online(center: &MemoryRegistryCenter, host: &str, group: &str) -> ServiceUrl {
        let url = ServiceUrl::new("infinity", host, 26000, "com.acme.FooService")
            .with_parameter(GROUP_KEY, group);
        center.register(&url).expect("注册");
        center.available(&url).expect("可用");
        url
    }

    fn manager(center: &Arc<MemoryRegistryCenter>, local_ip: &str) -> Arc<CommandServiceManager> {
        let client = ServiceUrl::new("infinity", local_ip, 0, "com.acme.FooService");
        let backend: Arc<dyn RegistryBackend> = center.clone();
        CommandServiceManager::new(client, backend, local_ip.to_owned())
    }

    fn hosts(urls: &[ServiceUrl]) -> Vec<&str> {
        urls.iter().map(ServiceUrl::host).collect()
    }

    #[test]
    fn no_command_uses_own_group() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        online(&center, "10.0.0.2", "other");
        let manager = manager(&center, "1.1.1.5");
        assert_eq!(hosts(&manager.discover(None)), vec!["10.0.0.1"]);
        assert_eq!(manager.cached_groups(), vec!["default_rpc".to_owned()]);
    }

    #[test]
    fn merge_prepends_weight_rule() {
        let center = center();
        online(&center, "10.0.0.1", "g1");
        online(&center, "10.0.0.2", "g2");
        let manager = manager(&center, "1.1.1.5");
        let urls = manager.discover(Some(
            r#"{"clientCommandList":[{"pattern":"*","mergeGroups":["g1:2","g2"]}]}"#,
        ));
        assert_eq!(urls[0].protocol(), RULE_PROTOCOL);
        assert_eq!(urls[0].host(), "1.1.1.5");
        assert_eq!(urls[0].get_parameter(WEIGHTS_KEY), Some("g1:2,g2:1"));
        assert_eq!(hosts(&urls[1..]), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn single_merge_group_has_no_rule_url() {
        let center = center();
        online(&center, "10.0.0.2", "g2");
        let manager = manager(&center, "1.1.1.5");
        let urls = manager.discover(Some(
            r#"{"clientCommandList":[{"pattern":"*","mergeGroups":["g2:5"]}]}"#,
        ));
        assert_eq!(hosts(&urls), vec!["10.0.0.2"]);
    }

    #[test]
    #[traced_test]
    fn malformed_command_degrades_to_own_group() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        let manager = manager(&center, "1.1.1.5");
        assert_eq!(hosts(&manager.discover(Some("{broken"))), vec!["10.0.0.1"]);
        assert!(logs_contain("routing command ignored"));
    }

    #[test]
    #[traced_test]
    fn malformed_route_rule_is_skipped() {
        let center = center();
        online(&center, "1.1.1.1", "default_rpc");
        online(&center, "2.2.2.2", "default_rpc");
        let manager = manager(&center, "1.1.1.5");
        let urls = manager.discover(Some(
            r#"{"clientCommandList":[{"pattern":"*","routeRules":["bogus","1.* to 2.*"]}]}"#,
        ));
        assert_eq!(hosts(&urls), vec!["2.2.2.2"]);
        assert!(logs_contain("route rule ignored"));
    }

    #[test]
    fn group_pushes_recompute_and_evicted_groups_are_ignored() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        online(&center, "10.0.0.2", "g2");
        let manager = manager(&center, "1.1.1.5");
        let capture = Arc::new(Capture::default());
        manager.add_listener(capture.clone());
        manager.subscribe_own_group().expect("订阅本分组");
        center.subscribe_command(&manager.client().copy(), manager.clone()).expect("订阅指令");

        let merge = r#"{"clientCommandList":[{"pattern":"*","mergeGroups":["default_rpc:1","g2:1"]}]}"#;
        center.set_command("default_rpc", Some(merge));
        let merged = capture.last.lock().clone().unwrap_or_default();
        assert_eq!(merged.len(), 3, "权重伪 URL + 两个分组");
        assert_eq!(center.service_watch_count("g2", "com.acme.FooService"), 1);

        online(&center, "10.0.0.3", "g2");
        let merged = capture.last.lock().clone().unwrap_or_default();
        assert_eq!(merged.len(), 4, "合并分组的推送触发重算");

        center.set_command("default_rpc", None);
        assert_eq!(manager.cached_groups(), vec!["default_rpc".to_owned()]);
        assert_eq!(center.service_watch_count("g2", "com.acme.FooService"), 0);
        let before = *capture.count.lock();
        manager.notify_service(
            &manager.client().copy_with_group("g2"),
            center.url(),
            &[ServiceUrl::new("infinity", "10.0.0.9", 1, "com.acme.FooService")],
        );
        assert_eq!(*capture.count.lock(), before, "已淘汰分组的推送应被丢弃");
    }

    /// 订阅时立即同步推送当前列表的注册中心。
    struct PushOnSubscribe(Arc<MemoryRegistryCenter>);

    impl RegistryBackend for PushOnSubscribe {
        fn url(&self) -> &ServiceUrl {
            self.0.url()
        }
        fn register(&self, url: &ServiceUrl) -> Result<(), BackendError> {
            self.0.register(url)
        }
        fn unregister(&self, url: &ServiceUrl) -> Result<(), BackendError> {
            self.0.unregister(url)
        }
        fn available(&self, url: &ServiceUrl) -> Result<(), BackendError> {
            self.0.available(url)
        }
        fn unavailable(&self, url: &ServiceUrl) -> Result<(), BackendError> {
            self.0.unavailable(url)
        }
        fn subscribe_service(
            &self,
            url: &ServiceUrl,
            listener: Arc<dyn ServiceListener>,
        ) -> Result<(), BackendError> {
            self.0.subscribe_service(url, Arc::clone(&listener))?;
            let urls = self.0.discover_service(url)?;
            listener.notify_service(url, self.0.url(), &urls);
            Ok(())
        }
        fn unsubscribe_service(
            &self,
            url: &ServiceUrl,
            listener: &Arc<dyn ServiceListener>,
        ) -> Result<(), BackendError> {
            self.0.unsubscribe_service(url, listener)
        }
        fn subscribe_command(
            &self,
            url: &ServiceUrl,
            listener: Arc<dyn CommandListener>,
        ) -> Result<(), BackendError> {
            self.0.subscribe_command(url, listener)
        }
        fn unsubscribe_command(
            &self,
            url: &ServiceUrl,
            listener: &Arc<dyn CommandListener>,
        ) -> Result<(), BackendError> {
            self.0.unsubscribe_command(url, listener)
        }
        fn discover_service(&self, url: &ServiceUrl) -> Result<Vec<ServiceUrl>, BackendError> {
            self.0.discover_service(url)
        }
        fn discover_command(&self, url: &ServiceUrl) -> Result<Option<String>, BackendError> {
            self.0.discover_command(url)
        }
    }

    #[test]
    fn push_during_subscribe_is_accepted() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        let client = ServiceUrl::new("infinity", "1.1.1.5", 0, "com.acme.FooService");
        let backend: Arc<dyn RegistryBackend> = Arc::new(PushOnSubscribe(center.clone()));
        let manager = CommandServiceManager::new(client, backend, "1.1.1.5".to_owned());
        let capture = Arc::new(Capture::default());
        manager.add_listener(capture.clone());

        manager.subscribe_own_group().expect("订阅本分组");
        assert_eq!(*capture.count.lock(), 1, "订阅过程中的同步推送不应被丢弃");
        let pushed = capture.last.lock().clone().unwrap_or_default();
        assert_eq!(hosts(&pushed), vec!["10.0.0.1"]);
    }

    #[test]
    fn failed_watch_can_be_retried() {
        let center = center();
        let manager = manager(&center, "1.1.1.5");
        center.set_online(false);
        assert!(manager.subscribe_own_group().is_err());
        center.set_online(true);
        manager.subscribe_own_group().expect("恢复后重新订阅");
        assert_eq!(center.service_watch_count("default_rpc", "com.acme.FooService"), 1);
    }

    #[test]
    fn own_group_stays_watched_when_command_moves_traffic_away() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        online(&center, "10.0.0.2", "g2");
        let manager = manager(&center, "1.1.1.5");
        manager.subscribe_own_group().expect("订阅本分组");

        let urls = manager.discover(Some(
            r#"{"clientCommandList":[{"pattern":"*","mergeGroups":["g2"]}]}"#,
        ));
        assert_eq!(hosts(&urls), vec!["10.0.0.2"]);
        assert_eq!(center.service_watch_count("default_rpc", "com.acme.FooService"), 1);
        assert_eq!(center.service_watch_count("g2", "com.acme.FooService"), 1);

        manager.release().expect("释放");
        assert_eq!(center.service_watch_count("default_rpc", "com.acme.FooService"), 0);
        assert_eq!(center.service_watch_count("g2", "com.acme.FooService"), 0);
    }

    #[test]
    fn detached_manager_opens_no_watches() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        online(&center, "10.0.0.2", "g2");
        let client = ServiceUrl::new("infinity", "1.1.1.5", 0, "com.acme.FooService");
        let backend: Arc<dyn RegistryBackend> = center.clone();
        let manager = CommandServiceManager::detached(client, backend, "1.1.1.5".to_owned());

        let urls = manager.discover(Some(
            r#"{"clientCommandList":[{"pattern":"*","mergeGroups":["default_rpc:1","g2:1"]}]}"#,
        ));
        assert_eq!(hosts(&urls[1..]), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(center.service_watch_count("default_rpc", "com.acme.FooService"), 0);
        assert_eq!(center.service_watch_count("g2", "com.acme.FooService"), 0);
    }

    #[test]
    fn identical_command_push_is_short_circuited() {
        let center = center();
        online(&center, "10.0.0.1", "default_rpc");
        let manager = manager(&center, "1.1.1.5");
        let capture = Arc::new(Capture::default());
        manager.add_listener(capture.clone());
        let command = r#"{"clientCommandList":[{"pattern":"*"}]}"#;
        manager.notify_command(manager.client(), Some(command));
        manager.notify_command(manager.client(), Some(command));
        assert_eq!(*capture.count.lock(), 1);
        assert_eq!(manager.command_text().as_deref(), Some(command));
    }
}
