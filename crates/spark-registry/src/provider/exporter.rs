//! 服务导出表：传输层按服务 URL 找到本地调用入口。

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::ProviderInvoker;
use super::message::{Request, Response, RpcException};
use crate::url::ServiceUrl;

/// 传输层导出契约。
pub trait ServiceExporter: Send + Sync {
    fn export(&self, invoker: Arc<ProviderInvoker>);

    fn unexport(&self, url: &ServiceUrl) -> Option<Arc<ProviderInvoker>>;
}

/// 导出键：`group/path/version`，同一服务的不同地址参数不影响分发。
fn export_key(url: &ServiceUrl) -> String {
    format!("{}/{}/{}", url.group(), url.path(), url.version())
}

/// 进程内导出表。
#[derive(Default)]
pub struct LocalExporter {
    invokers: DashMap<String, Arc<ProviderInvoker>>,
}

impl LocalExporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invoker(&self, url: &ServiceUrl) -> Option<Arc<ProviderInvoker>> {
        self.invokers
            .get(&export_key(url))
            .map(|invoker| Arc::clone(invoker.value()))
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// 把请求分发给 `url` 对应的调用入口；未导出时返回“服务不存在”响应。
    pub fn dispatch(&self, url: &ServiceUrl, request: &Request) -> Response {
        match self.invoker(url) {
            Some(invoker) => invoker.local_call(request),
            None => {
                warn!(url = %url.uri(), "no exported service for request");
                Response::failure(
                    request,
                    RpcException::ServiceNotFound {
                        interface: request.interface.clone(),
                        signature: request.method_signature(),
                    },
                )
            }
        }
    }
}

impl ServiceExporter for LocalExporter {
    fn export(&self, invoker: Arc<ProviderInvoker>) {
        let key = export_key(invoker.url());
        debug!(service = %key, "service exported");
        self.invokers.insert(key, invoker);
    }

    fn unexport(&self, url: &ServiceUrl) -> Option<Arc<ProviderInvoker>> {
        self.invokers
            .remove(&export_key(url))
            .map(|(_, invoker)| invoker)
    }
}
