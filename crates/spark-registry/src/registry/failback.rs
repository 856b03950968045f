//! 失败回退：把注册中心的瞬时故障转换为后台重试。
//!
//! # 教案式说明
//! - **意图（Why）**：注册中心短暂不可达时，提供方的注册、消费方的订阅不应失败，更不应丢失；
//!   调用方拿到 `Ok(())`，意图进入失败队列，由后台线程按固定周期补做。
//! - **契约（What）**：
//!   - 四个互相独立的失败队列：注册、注销（按身份去重）、订阅、退订（身份 → 监听者集合）；
//!   - `check=true`（URL 参数优先，其次注册中心配置）时失败立即返回给调用方，注册意图同时撤销；
//!   - 订阅失败时若本地已有缓存，先用陈旧缓存通知监听者，再排队重试（`check=true` 时改为上抛错误）；
//!   - 每轮重试依次处理注册、注销、订阅、退订，条目在重试前先出队，再次失败时重新入队；
//!   - 固定周期，无指数退避；`discover` 从不排队。
//! - **线程模型（How）**：[`RetryScheduler`] 是进程内唯一的重试线程，多个注册实例以 `Weak` 形式登记，
//!   各自带有独立周期；同一实例的重试轮次由内部互斥锁串行化，手动调用 [`FailbackRegistry::retry`]
//!   与后台线程不会交错执行。

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::core::RegistryCore;
use super::{Registry, SubscriptionSnapshot};
use crate::constants::CHECK_KEY;
use crate::error::RegistryError;
use crate::listener::{ListenerHandle, NotifyListener};
use crate::url::ServiceUrl;

/// 可被重试线程周期调用的任务。
pub trait RetryTask: Send + Sync {
    fn retry(&self);
}

struct Scheduled {
    task: Weak<dyn RetryTask>,
    period: Duration,
    next_due: Instant,
}

#[derive(Default)]
struct SchedulerState {
    tasks: Vec<Scheduled>,
    stopped: bool,
}

#[derive(Default)]
struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// 单线程周期重试调度器。
pub struct RetryScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// 启动后台线程。线程创建失败时记录错误，调度器退化为只能手动重试。
    pub fn start() -> Self {
        let shared = Arc::new(SchedulerShared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("spark-registry-retry".to_owned())
            .spawn(move || run_scheduler(&worker_shared));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to spawn registry retry worker");
                None
            }
        };
        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// 登记任务，首次执行发生在一个周期之后。
    pub fn schedule(&self, task: Weak<dyn RetryTask>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let mut state = self.shared.state.lock();
        state.tasks.push(Scheduled {
            task,
            period,
            next_due: Instant::now() + period,
        });
        self.shared.wakeup.notify_all();
    }

    /// 仍存活的登记任务数量。
    pub fn task_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .tasks
            .iter()
            .filter(|scheduled| scheduled.task.strong_count() > 0)
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.shared.state.lock().stopped
    }

    /// 停止并等待后台线程退出；重复调用无副作用。
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.tasks.clear();
        }
        self.shared.wakeup.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("registry retry worker panicked");
            }
            info!("registry retry worker stopped");
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_scheduler(shared: &SchedulerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }
        state.tasks.retain(|scheduled| scheduled.task.strong_count() > 0);

        let now = Instant::now();
        let mut due = Vec::new();
        for scheduled in state.tasks.iter_mut() {
            if scheduled.next_due <= now {
                scheduled.next_due = now + scheduled.period;
                if let Some(task) = scheduled.task.upgrade() {
                    due.push(task);
                }
            }
        }
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for task in due {
                    if catch_unwind(AssertUnwindSafe(|| task.retry())).is_err() {
                        error!("registry retry task panicked");
                    }
                }
            });
            continue;
        }

        match state.tasks.iter().map(|scheduled| scheduled.next_due).min() {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

#[derive(Debug)]
struct FailedSubscription {
    url: ServiceUrl,
    listeners: HashSet<ListenerHandle>,
}

/// 带失败回退的注册实例。
pub struct FailbackRegistry {
    core: Arc<RegistryCore>,
    check: bool,
    retry_period: Duration,
    failed_registered: DashMap<String, ServiceUrl>,
    failed_unregistered: DashMap<String, ServiceUrl>,
    failed_subscribed: DashMap<String, FailedSubscription>,
    failed_unsubscribed: DashMap<String, FailedSubscription>,
    cycle: Mutex<()>,
}

impl std::fmt::Debug for FailbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailbackRegistry")
            .field("check", &self.check)
            .field("retry_period", &self.retry_period)
            .finish_non_exhaustive()
    }
}

impl FailbackRegistry {
    /// 包装核心。`check` 是注册中心级别的快速失败开关，可被单个 URL 的 `check` 参数覆盖。
    pub fn new(core: Arc<RegistryCore>, check: bool, retry_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            core,
            check,
            retry_period,
            failed_registered: DashMap::new(),
            failed_unregistered: DashMap::new(),
            failed_subscribed: DashMap::new(),
            failed_unsubscribed: DashMap::new(),
            cycle: Mutex::new(()),
        })
    }

    pub fn core(&self) -> &Arc<RegistryCore> {
        &self.core
    }

    pub fn retry_period(&self) -> Duration {
        self.retry_period
    }

    pub fn failed_registered(&self) -> Vec<ServiceUrl> {
        self.failed_registered
            .iter()
            .map(|entry| entry.value().copy())
            .collect()
    }

    pub fn failed_unregistered(&self) -> Vec<ServiceUrl> {
        self.failed_unregistered
            .iter()
            .map(|entry| entry.value().copy())
            .collect()
    }

    /// 订阅失败队列：URL 与等待重试的监听者数量。
    pub fn failed_subscribed(&self) -> Vec<(ServiceUrl, usize)> {
        snapshot_failed(&self.failed_subscribed)
    }

    pub fn failed_unsubscribed(&self) -> Vec<(ServiceUrl, usize)> {
        snapshot_failed(&self.failed_unsubscribed)
    }

    /// 四个队列中等待重试的条目总数。
    pub fn pending_failures(&self) -> usize {
        let listeners = |map: &DashMap<String, FailedSubscription>| -> usize {
            map.iter().map(|entry| entry.listeners.len()).sum()
        };
        self.failed_registered.len()
            + self.failed_unregistered.len()
            + listeners(&self.failed_subscribed)
            + listeners(&self.failed_unsubscribed)
    }

    /// 立即执行一轮重试。
    pub fn retry(&self) {
        let _cycle = self.cycle.lock();
        if self.core.is_closed() {
            return;
        }
        self.retry_registered();
        self.retry_unregistered();
        self.retry_subscribed();
        self.retry_unsubscribed();
    }

    fn is_checking(&self, url: &ServiceUrl) -> bool {
        url.get_bool_parameter(CHECK_KEY, self.check)
    }

    fn retry_registered(&self) {
        for url in drain(&self.failed_registered) {
            match self.core.register(&url) {
                Ok(()) => info!(url = %url, "retry register succeeded"),
                Err(err) => {
                    warn!(url = %url, error = %err, code = err.code(), "retry register failed");
                    self.failed_registered.entry(url.identity()).or_insert(url);
                }
            }
        }
    }

    fn retry_unregistered(&self) {
        for url in drain(&self.failed_unregistered) {
            match self.core.unregister(&url) {
                Ok(()) => info!(url = %url, "retry unregister succeeded"),
                Err(err) => {
                    warn!(url = %url, error = %err, code = err.code(), "retry unregister failed");
                    self.failed_unregistered
                        .entry(url.identity())
                        .or_insert(url);
                }
            }
        }
    }

    fn retry_subscribed(&self) {
        for failed in drain(&self.failed_subscribed) {
            for handle in failed.listeners {
                match self.core.subscribe(&failed.url, Arc::clone(handle.listener())) {
                    Ok(()) => info!(url = %failed.url, "retry subscribe succeeded"),
                    Err(err) => {
                        warn!(url = %failed.url, error = %err, code = err.code(), "retry subscribe failed");
                        enqueue(&self.failed_subscribed, &failed.url, handle);
                    }
                }
            }
        }
    }

    fn retry_unsubscribed(&self) {
        for failed in drain(&self.failed_unsubscribed) {
            for handle in failed.listeners {
                match self.core.unsubscribe(&failed.url, handle.listener()) {
                    Ok(()) => info!(url = %failed.url, "retry unsubscribe succeeded"),
                    Err(err) => {
                        warn!(url = %failed.url, error = %err, code = err.code(), "retry unsubscribe failed");
                        enqueue(&self.failed_unsubscribed, &failed.url, handle);
                    }
                }
            }
        }
    }

    fn forget_failed_listener(&self, url: &ServiceUrl, handle: &ListenerHandle) {
        let identity = url.identity();
        for map in [&self.failed_subscribed, &self.failed_unsubscribed] {
            if let Some(mut failed) = map.get_mut(&identity) {
                failed.listeners.remove(handle);
            }
            map.remove_if(&identity, |_, failed| failed.listeners.is_empty());
        }
    }
}

/// 逐个取出队列条目；取出即删除，保证重试前已出队。
fn drain<V>(map: &DashMap<String, V>) -> Vec<V> {
    let keys: Vec<String> = map.iter().map(|entry| entry.key().clone()).collect();
    keys.into_iter()
        .filter_map(|key| map.remove(&key).map(|(_, value)| value))
        .collect()
}

fn enqueue(map: &DashMap<String, FailedSubscription>, url: &ServiceUrl, handle: ListenerHandle) {
    map.entry(url.identity())
        .or_insert_with(|| FailedSubscription {
            url: url.copy(),
            listeners: HashSet::new(),
        })
        .listeners
        .insert(handle);
}

fn snapshot_failed(map: &DashMap<String, FailedSubscription>) -> Vec<(ServiceUrl, usize)> {
    map.iter()
        .map(|entry| (entry.url.copy(), entry.listeners.len()))
        .collect()
}

impl RetryTask for FailbackRegistry {
    fn retry(&self) {
        FailbackRegistry::retry(self);
    }
}

impl Registry for FailbackRegistry {
    fn url(&self) -> &ServiceUrl {
        self.core.url()
    }

    fn register(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        let identity = url.identity();
        self.failed_registered.remove(&identity);
        self.failed_unregistered.remove(&identity);
        match self.core.register(url) {
            Ok(()) => Ok(()),
            Err(err @ RegistryError::Closed { .. }) => Err(err),
            Err(err) => {
                if self.is_checking(url) {
                    self.core.forget(url);
                    return Err(err);
                }
                warn!(url = %url, error = %err, code = err.code(), "register failed, queued for retry");
                self.failed_registered.insert(identity, url.copy());
                Ok(())
            }
        }
    }

    fn unregister(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        let identity = url.identity();
        self.failed_registered.remove(&identity);
        self.failed_unregistered.remove(&identity);
        match self.core.unregister(url) {
            Ok(()) => Ok(()),
            Err(err @ RegistryError::Closed { .. }) => Err(err),
            Err(err) => {
                if self.is_checking(url) {
                    return Err(err);
                }
                warn!(url = %url, error = %err, code = err.code(), "unregister failed, queued for retry");
                self.failed_unregistered.insert(identity, url.copy());
                Ok(())
            }
        }
    }

    fn available(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        self.core.available(url)
    }

    fn unavailable(&self, url: &ServiceUrl) -> Result<(), RegistryError> {
        self.core.unavailable(url)
    }

    fn subscribe(
        &self,
        url: &ServiceUrl,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        let handle = ListenerHandle::new(Arc::clone(&listener));
        self.forget_failed_listener(url, &handle);
        match self.core.subscribe(url, Arc::clone(&listener)) {
            Ok(()) => Ok(()),
            Err(err @ RegistryError::Closed { .. }) => Err(err),
            Err(err) => {
                let stale = self.core.replay_cached(url, &listener);
                if self.is_checking(url) {
                    return Err(err);
                }
                warn!(
                    url = %url,
                    error = %err,
                    code = err.code(),
                    stale,
                    "subscribe failed, queued for retry"
                );
                enqueue(&self.failed_subscribed, url, handle);
                Ok(())
            }
        }
    }

    fn unsubscribe(
        &self,
        url: &ServiceUrl,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        let handle = ListenerHandle::new(Arc::clone(listener));
        self.forget_failed_listener(url, &handle);
        match self.core.unsubscribe(url, listener) {
            Ok(()) => Ok(()),
            Err(err @ RegistryError::Closed { .. }) => Err(err),
            Err(err) => {
                if self.is_checking(url) {
                    return Err(err);
                }
                warn!(url = %url, error = %err, code = err.code(), "unsubscribe failed, queued for retry");
                enqueue(&self.failed_unsubscribed, url, handle);
                Ok(())
            }
        }
    }

    fn discover(&self, url: &ServiceUrl) -> Vec<ServiceUrl> {
        self.core.discover(url)
    }

    fn registered_urls(&self) -> Vec<ServiceUrl> {
        self.core.registered_urls()
    }

    fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.core.subscriptions()
    }

    fn close(&self) {
        let _cycle = self.cycle.lock();
        self.core.close();
        self.failed_registered.clear();
        self.failed_unregistered.clear();
        self.failed_subscribed.clear();
        self.failed_unsubscribed.clear();
        debug!(registry = %self.core.url().uri(), "failback queues cleared");
    }
}
