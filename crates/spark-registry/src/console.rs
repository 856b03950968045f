//! 管理控制台使用的协作接口。
//!
//! # 教案式说明
//! - **意图（Why）**：管理端只需要“注册/注销、上下线、按条件查询、通用调用”几件事，
//!   不应该知道指令路由或失败回退的内部结构；本模块把这些操作收拢为 [`RegistryConsole`]。
//! - **契约（What）**：
//!   - 查询类操作是订阅缓存的只读投影，结果按完整 URL 字符串排序后分页；
//!   - 通用调用通过 [`ConsumerStubFactory`] 临时构造消费端桩，参数以 JSON 数组传入；
//!   - 注销、上下线、查询都只作用于已存在的注册实例，不会隐式创建。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{APPLICATION_KEY, NODE_TYPE_APPLICATION_PROVIDER, NODE_TYPE_SERVICE};
use crate::error::ConsoleError;
use crate::provider::{LocalExporter, ProviderInvoker, Request, Response};
use crate::registry::{FailbackRegistry, Registry, RegistryFactory};
use crate::url::ServiceUrl;

/// 分页请求，`page` 从 0 开始。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self { page, size }
    }

    fn slice<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let items = if self.size == 0 {
            Vec::new()
        } else {
            items
                .into_iter()
                .skip(self.page.saturating_mul(self.size))
                .take(self.size)
                .collect()
        };
        Page { total, items }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

/// 一页查询结果；`total` 是过滤后、分页前的总数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub total: usize,
    pub items: Vec<T>,
}

/// 查询过滤条件，未设置的字段不参与过滤。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UrlFilter {
    pub group: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
}

impl UrlFilter {
    fn accepts(&self, url: &ServiceUrl) -> bool {
        self.group.as_deref().is_none_or(|group| url.group() == group)
            && self.path.as_deref().is_none_or(|path| url.path() == path)
            && self.host.as_deref().is_none_or(|host| url.host() == host)
    }
}

/// 针对单个提供方地址的一次性调用桩。
pub trait GenericStub: Send + Sync {
    fn call(&self, request: &Request) -> Response;
}

/// 按提供方地址构造调用桩；地址不可达时返回 `None`。
pub trait ConsumerStubFactory: Send + Sync {
    fn create(&self, provider: &ServiceUrl) -> Option<Box<dyn GenericStub>>;
}

/// 直接调用进程内导出表的桩。
struct LocalStub {
    invoker: Arc<ProviderInvoker>,
}

impl GenericStub for LocalStub {
    fn call(&self, request: &Request) -> Response {
        self.invoker.local_call(request)
    }
}

impl ConsumerStubFactory for LocalExporter {
    fn create(&self, provider: &ServiceUrl) -> Option<Box<dyn GenericStub>> {
        self.invoker(provider)
            .map(|invoker| Box::new(LocalStub { invoker }) as Box<dyn GenericStub>)
    }
}

/// 管理端入口。
pub struct RegistryConsole {
    factory: Arc<RegistryFactory>,
    stubs: Arc<dyn ConsumerStubFactory>,
    next_request_id: AtomicU64,
}

impl RegistryConsole {
    pub fn new(factory: Arc<RegistryFactory>, stubs: Arc<dyn ConsumerStubFactory>) -> Self {
        Self {
            factory,
            stubs,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn factory(&self) -> &Arc<RegistryFactory> {
        &self.factory
    }

    pub fn register(&self, registry_url: &ServiceUrl, url: &ServiceUrl) -> Result<(), ConsoleError> {
        self.factory.get_registry(registry_url)?.register(url)?;
        Ok(())
    }

    pub fn unregister(&self, registry_url: &ServiceUrl, url: &ServiceUrl) -> Result<(), ConsoleError> {
        self.existing(registry_url)?.unregister(url)?;
        Ok(())
    }

    /// 把已注册的提供方标记为可用。
    pub fn activate(&self, registry_url: &ServiceUrl, url: &ServiceUrl) -> Result<(), ConsoleError> {
        self.existing(registry_url)?.available(url)?;
        Ok(())
    }

    /// 把已注册的提供方标记为不可用，注册本身保留。
    pub fn deactivate(&self, registry_url: &ServiceUrl, url: &ServiceUrl) -> Result<(), ConsoleError> {
        self.existing(registry_url)?.unavailable(url)?;
        Ok(())
    }

    /// 订阅缓存中的提供方地址。
    pub fn find_providers(
        &self,
        registry_url: &ServiceUrl,
        filter: &UrlFilter,
        page: PageRequest,
    ) -> Result<Page<ServiceUrl>, ConsoleError> {
        let snapshots = self.existing(registry_url)?.subscriptions();
        let urls = snapshots
            .iter()
            .flat_map(|snapshot| snapshot.partition(NODE_TYPE_SERVICE).iter().cloned())
            .filter(|url| filter.accepts(url));
        Ok(page.slice(sorted_unique(urls)))
    }

    /// 持有订阅的消费方（订阅客户端 URL）。
    pub fn find_consumers(
        &self,
        registry_url: &ServiceUrl,
        filter: &UrlFilter,
        page: PageRequest,
    ) -> Result<Page<ServiceUrl>, ConsoleError> {
        let registry = self.existing(registry_url)?;
        let clients = registry
            .subscriptions()
            .into_iter()
            .map(|snapshot| snapshot.client)
            .filter(|url| filter.accepts(url));
        Ok(page.slice(sorted_unique(clients)))
    }

    /// 订阅缓存中出现过的应用名，取自应用级标记 URL。
    pub fn find_applications(
        &self,
        registry_url: &ServiceUrl,
        filter: &UrlFilter,
        page: PageRequest,
    ) -> Result<Page<String>, ConsoleError> {
        let registry = self.existing(registry_url)?;
        let names: BTreeSet<String> = registry
            .subscriptions()
            .iter()
            .flat_map(|snapshot| snapshot.partition(NODE_TYPE_APPLICATION_PROVIDER).to_vec())
            .filter(|url| filter.accepts(url))
            .filter_map(|url| url.get_parameter(APPLICATION_KEY).map(str::to_owned))
            .collect();
        Ok(page.slice(names.into_iter().collect()))
    }

    /// 对任意提供方地址发起一次通用调用，`arguments_json` 必须是 JSON 数组。
    pub fn invoke(
        &self,
        provider_url: &str,
        method: &str,
        param_types: &[&str],
        arguments_json: &str,
    ) -> Result<Value, ConsoleError> {
        let url = ServiceUrl::parse(provider_url)?;
        let arguments: Vec<Value> =
            serde_json::from_str(arguments_json).map_err(|err| ConsoleError::InvalidArguments {
                method: method.to_owned(),
                detail: err.to_string(),
            })?;
        let Some(stub) = self.stubs.create(&url) else {
            warn!(provider = %url.uri(), method, "no stub for provider");
            return Err(ConsoleError::Invocation {
                method: method.to_owned(),
                detail: format!("provider `{}` is not reachable", url.uri()),
            });
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(request_id, url.path(), method)
            .with_signature(param_types)
            .with_arguments(arguments);
        debug!(provider = %url.uri(), method = %request.method_signature(), request_id, "console invoke");
        let response = stub.call(&request);
        match response.exception {
            Some(exception) => Err(ConsoleError::Invocation {
                method: request.method_signature(),
                detail: exception.to_string(),
            }),
            None => Ok(response.value.unwrap_or(Value::Null)),
        }
    }

    fn existing(&self, registry_url: &ServiceUrl) -> Result<Arc<FailbackRegistry>, ConsoleError> {
        self.factory
            .lookup(registry_url)
            .ok_or_else(|| ConsoleError::RegistryNotFound {
                registry: registry_url.uri(),
            })
    }
}

fn sorted_unique(urls: impl Iterator<Item = ServiceUrl>) -> Vec<ServiceUrl> {
    let mut seen = BTreeSet::new();
    let mut unique: Vec<ServiceUrl> = urls.filter(|url| seen.insert(url.identity())).collect();
    unique.sort_by_key(ServiceUrl::to_full_string);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCenterProvider;
    use crate::config::RegistryConfig;
    use crate::provider::{ServiceDefinition, ServiceExporter, ServiceFault};
    use serde_json::json;

    fn definition() -> ServiceDefinition {
        ServiceDefinition::builder("com.acme.Calc")
            .method("add", &["int", "int"], |args| {
                let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
                Ok(json!(sum))
            })
            .method("fail", &[], |_| Err(ServiceFault::new("Boom", "nope")))
            .build()
    }

    fn console() -> (Arc<LocalExporter>, RegistryConsole) {
        let exporter = LocalExporter::new();
        let factory = Arc::new(RegistryFactory::new(
            MemoryCenterProvider::new(),
            RegistryConfig::default(),
        ));
        let console = RegistryConsole::new(factory, exporter.clone());
        (exporter, console)
    }

    #[test]
    fn page_request_slices_and_counts() {
        let page = PageRequest::new(1, 2).slice(vec![1, 2, 3, 4, 5]);
        assert_eq!(page.total, 5);
        assert_eq!(page.items, vec![3, 4]);
        let beyond = PageRequest::new(9, 2).slice(vec![1, 2]);
        assert_eq!(beyond.total, 2);
        assert!(beyond.items.is_empty());
    }

    #[test]
    fn universal_invoke_decodes_json_arguments() {
        let (exporter, console) = console();
        let url = ServiceUrl::new("infinity", "10.0.0.5", 26000, "com.acme.Calc");
        exporter.export(ProviderInvoker::new(url.copy(), definition()));

        let value = console
            .invoke(&url.to_full_string(), "add", &["int", "int"], "[2, 40]")
            .expect("调用应成功");
        assert_eq!(value, json!(42));

        let err = console
            .invoke(&url.to_full_string(), "add", &["int", "int"], "{\"a\":1}")
            .expect_err("非数组参数应报错");
        assert_eq!(err.code(), "registry.console.invalid_arguments");

        let err = console
            .invoke(&url.to_full_string(), "fail", &[], "[]")
            .expect_err("业务失败应报错");
        assert_eq!(err.code(), "registry.console.invocation");
        assert!(err.to_string().contains("Boom"));
    }

    #[test]
    fn unknown_registry_is_reported() {
        let (_exporter, console) = console();
        let registry = ServiceUrl::parse("memory://127.0.0.1:2181").expect("解析");
        let err = console
            .find_providers(&registry, &UrlFilter::default(), PageRequest::default())
            .expect_err("未创建的注册实例应报错");
        assert_eq!(err.code(), "registry.console.not_found");
    }
}
