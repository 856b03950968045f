//! 提供方本地调用入口。
//!
//! # 教案式说明
//! - **意图（Why）**：传输层收到请求后只需要一个“按签名找到方法并执行”的入口；方法不存在、业务失败、
//!   处理函数 panic 都必须转换为响应里的异常，而不是把错误抛回传输线程。
//! - **注册（What）**：[`ProviderInvoker::register`] 先导出服务，再向每个注册中心注册服务 URL 与一条
//!   应用级标记 URL，全部尝试结束后才置为活跃并打开心跳开关，由心跳开关触发可用性扫描。
//! - **异常栈策略（What）**：
//!   - 默认向调用方传递异常栈；
//!   - 业务失败的类型在方法上有声明时，日志降级为 `info`，且默认改为不传递异常栈；
//!   - 服务 URL 的 `transExceptionStack` 参数显式覆盖上述默认值；
//!   - 不传递时异常栈被替换为单个占位帧。
//!
//!   “声明过的失败不传递栈”这一联动保持原有行为，不额外收紧或放宽。

pub mod exporter;
pub mod message;
pub mod method;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::config::RegistryConfig;
use crate::constants::{
    APPLICATION_KEY, NODE_TYPE_APPLICATION_PROVIDER, NODE_TYPE_KEY, TRANSMIT_EXCEPTION_STACK_KEY,
};
use crate::error::RegistryError;
use crate::registry::{Registry, RegistryFactory};
use crate::url::ServiceUrl;

pub use exporter::{LocalExporter, ServiceExporter};
pub use message::{Request, Response, RpcException};
pub use method::{
    MASKED_FRAME, MethodDescriptor, MethodHandler, ServiceDefinition, ServiceDefinitionBuilder,
    ServiceFault,
};

/// 单个服务接口的本地调用入口。
#[derive(Debug)]
pub struct ProviderInvoker {
    url: ServiceUrl,
    definition: ServiceDefinition,
    transmit_stack_default: bool,
    active: AtomicBool,
}

impl ProviderInvoker {
    pub fn new(url: ServiceUrl, definition: ServiceDefinition) -> Arc<Self> {
        Self::with_config(url, definition, &RegistryConfig::default())
    }

    pub fn with_config(
        url: ServiceUrl,
        definition: ServiceDefinition,
        config: &RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            definition,
            transmit_stack_default: config.transmit_exception_stack,
            active: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 应用级标记 URL。
    pub fn application_marker(&self, app_name: &str) -> ServiceUrl {
        self.url
            .copy()
            .with_parameter(NODE_TYPE_KEY, NODE_TYPE_APPLICATION_PROVIDER)
            .with_parameter(APPLICATION_KEY, app_name)
    }

    /// 导出服务并注册到全部注册中心。
    ///
    /// 每个注册中心都会被尝试；任一失败时撤销导出并返回第一个错误，服务保持非活跃，心跳开关不变。
    pub fn register(
        self: &Arc<Self>,
        app_name: &str,
        exporter: &dyn ServiceExporter,
        factory: &RegistryFactory,
        registry_urls: &[ServiceUrl],
    ) -> Result<(), RegistryError> {
        exporter.export(Arc::clone(self));
        let marker = self.application_marker(app_name);
        let mut first_error = None;
        for registry_url in registry_urls {
            let attempt = factory.get_registry(registry_url).and_then(|registry| {
                registry.register(&self.url)?;
                registry.register(&marker)
            });
            if let Err(err) = attempt {
                error!(
                    registry = %registry_url.uri(),
                    url = %self.url,
                    error = %err,
                    code = err.code(),
                    "provider registration failed"
                );
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            exporter.unexport(&self.url);
            return Err(err);
        }
        self.active.store(true, Ordering::Release);
        factory.switch().turn_on();
        info!(url = %self.url, application = app_name, "provider registered");
        Ok(())
    }

    /// 注销每个注册中心上当前登记的全部 URL；没有实例或没有登记的注册中心记录告警后跳过。
    pub fn unregister(&self, factory: &RegistryFactory, registry_urls: &[ServiceUrl]) {
        for registry_url in registry_urls {
            let Some(registry) = factory.lookup(registry_url) else {
                warn!(registry = %registry_url.uri(), "unregister skipped: registry not found");
                continue;
            };
            let registered = registry.registered_urls();
            if registered.is_empty() {
                warn!(registry = %registry_url.uri(), "unregister skipped: nothing registered");
                continue;
            }
            for url in registered {
                if let Err(err) = registry.unregister(&url) {
                    warn!(registry = %registry_url.uri(), url = %url, error = %err, "unregister failed");
                }
            }
        }
        self.active.store(false, Ordering::Release);
    }

    /// 在调用线程上执行一次本地调用；任何失败都体现为响应里的异常。
    pub fn local_call(&self, request: &Request) -> Response {
        let Some(method) = self
            .definition
            .lookup(&request.method, &request.param_types)
        else {
            warn!(
                interface = %self.definition.interface(),
                method = %request.method_signature(),
                request_id = request.request_id,
                "service method not exist"
            );
            return Response::failure(
                request,
                RpcException::ServiceNotFound {
                    interface: self.definition.interface().to_owned(),
                    signature: request.method_signature(),
                },
            );
        };

        let mut transmit_default = self.transmit_stack_default;
        let outcome = catch_unwind(AssertUnwindSafe(|| method.invoke(&request.arguments)));
        let mut exception = match outcome {
            Ok(Ok(value)) => return Response::success(request, value),
            Ok(Err(fault)) => {
                if method.declares(&fault.kind) {
                    transmit_default = false;
                    info!(
                        method = %method.signature(),
                        request_id = request.request_id,
                        fault = %fault,
                        "declared exception raised during invocation"
                    );
                } else {
                    error!(
                        method = %method.signature(),
                        request_id = request.request_id,
                        fault = %fault,
                        stack = ?fault.stack,
                        "exception caught during method invocation"
                    );
                }
                RpcException::Business { cause: fault }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    method = %method.signature(),
                    request_id = request.request_id,
                    panic = %message,
                    "provider has encountered a fatal error"
                );
                RpcException::Fatal {
                    message,
                    stack: Vec::new(),
                }
            }
        };

        if !self
            .url
            .get_bool_parameter(TRANSMIT_EXCEPTION_STACK_KEY, transmit_default)
        {
            exception.mask_stack();
        }
        Response::failure(request, exception)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> ServiceDefinition {
        ServiceDefinition::builder("com.acme.FooService")
            .method("hello", &["string"], |args| {
                Ok(json!(format!("hello {}", args[0].as_str().unwrap_or("?"))))
            })
            .method_with_faults("withdraw", &["long"], &["InsufficientFunds"], |_| {
                Err(ServiceFault::new("InsufficientFunds", "balance too low")
                    .with_stack(["Account.withdraw(Account.rs:42)"]))
            })
            .method("explode", &[], |_| panic!("kaboom"))
            .method("leak", &[], |_| {
                Err(ServiceFault::new("IllegalState", "oops").with_stack(["Impl.leak(Impl.rs:7)"]))
            })
            .build()
    }

    fn invoker(url: ServiceUrl) -> Arc<ProviderInvoker> {
        ProviderInvoker::new(url, definition())
    }

    fn url() -> ServiceUrl {
        ServiceUrl::new("infinity", "10.0.0.5", 26000, "com.acme.FooService")
    }

    #[test]
    fn failed_registration_withdraws_export() {
        use crate::backend::MemoryCenterProvider;

        let centers = MemoryCenterProvider::new();
        let registry_url =
            ServiceUrl::parse("memory://127.0.0.1:2181?check=true").expect("注册中心 URL");
        centers.get_or_create(&registry_url).set_online(false);
        let factory = RegistryFactory::new(centers, RegistryConfig::default());
        let exporter = LocalExporter::new();

        let provider = invoker(url());
        let err = provider
            .register("accounts", exporter.as_ref(), &factory, &[registry_url])
            .expect_err("check=true 时注册失败应上抛");
        assert_eq!(err.code(), "registry.backend.unavailable");
        assert!(exporter.is_empty(), "注册失败后不应保留导出");
        assert!(!provider.is_active());
        assert!(!factory.switch().is_on());
    }

    #[test]
    fn success_carries_value_and_attachments() {
        let request = Request::new(7, "com.acme.FooService", "hello")
            .with_signature(&["string"])
            .with_arguments(vec![json!("spark")])
            .with_attachment("trace", "t-1");
        let response = invoker(url()).local_call(&request);
        assert!(response.is_ok());
        assert_eq!(response.value, Some(json!("hello spark")));
        assert_eq!(response.request_id, 7);
        assert_eq!(response.attachments.get("trace").map(String::as_str), Some("t-1"));
    }

    #[test]
    fn unknown_signature_is_not_found_response() {
        let request = Request::new(1, "com.acme.FooService", "hello").with_signature(&["int"]);
        let response = invoker(url()).local_call(&request);
        let exception = response.exception.expect("应返回异常");
        assert_eq!(exception.code(), "registry.invoke.not_found");
        assert!(exception.to_string().contains("hello(int)"));
    }

    #[test]
    fn declared_fault_suppresses_stack_by_default() {
        let request = Request::new(2, "com.acme.FooService", "withdraw").with_signature(&["long"]);
        let response = invoker(url()).local_call(&request);
        let exception = response.exception.expect("应返回异常");
        assert_eq!(exception.cause().map(|c| c.kind.as_str()), Some("InsufficientFunds"));
        assert_eq!(exception.stack(), [MASKED_FRAME.to_owned()]);
    }

    #[test]
    fn undeclared_fault_transmits_stack_by_default() {
        let request = Request::new(3, "com.acme.FooService", "leak");
        let response = invoker(url()).local_call(&request);
        let exception = response.exception.expect("应返回异常");
        assert_eq!(exception.stack(), ["Impl.leak(Impl.rs:7)".to_owned()]);
    }

    #[test]
    fn url_flag_overrides_default_policy() {
        let masked = invoker(url().with_parameter(TRANSMIT_EXCEPTION_STACK_KEY, "false"));
        let response = masked.local_call(&Request::new(4, "com.acme.FooService", "leak"));
        assert_eq!(
            response.exception.expect("应返回异常").stack(),
            [MASKED_FRAME.to_owned()]
        );

        let open = invoker(url().with_parameter(TRANSMIT_EXCEPTION_STACK_KEY, "true"));
        let response = open.local_call(
            &Request::new(5, "com.acme.FooService", "withdraw").with_signature(&["long"]),
        );
        assert_eq!(
            response.exception.expect("应返回异常").stack(),
            ["Account.withdraw(Account.rs:42)".to_owned()]
        );
    }

    #[test]
    fn panic_becomes_fatal_response() {
        let response = invoker(url()).local_call(&Request::new(6, "com.acme.FooService", "explode"));
        let exception = response.exception.expect("应返回异常");
        assert_eq!(exception.code(), "registry.invoke.fatal");
        assert!(exception.to_string().contains("kaboom"));
    }
}
