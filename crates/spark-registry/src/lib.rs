//! # spark-registry
//!
//! RPC 框架的客户端注册中心层。
//!
//! # 教案式导读
//!
//! - **意图（Why）**：让进程以提供方身份注册自身、以消费方身份发现并订阅提供方，
//!   在注册中心短暂不可用时不丢失状态，并按集中下发的路由指令在带权分组之间动态切换流量。
//! - **结构（How）**：
//!   - [`url`]：服务地址描述符 [`ServiceUrl`]，身份比较与参数读写；
//!   - [`registry`]：本地缓存核心、失败回退包装、重试调度与注册实例工厂；
//!   - [`command`]：路由指令解析、分组合并与 IP 路由规则，按订阅客户端维护有效提供方列表；
//!   - [`provider`]：提供方本地调用入口与异常栈策略；
//!   - [`backend`]：注册中心驱动契约与带故障注入的内存注册中心；
//!   - [`console`]：管理端使用的协作接口。
//! - **契约（What）**：对外失败统一为 [`error`] 中的 `thiserror` 枚举，每个枚举提供稳定的 `code()`；
//!   日志只通过 `tracing` 输出，是否落地由宿主调用 [`telemetry::install`] 决定。

pub mod backend;
pub mod command;
pub mod config;
pub mod console;
pub mod constants;
pub mod error;
pub mod listener;
pub mod provider;
pub mod registry;
pub mod switch;
pub mod telemetry;
pub mod url;

pub use backend::{BackendProvider, MemoryCenterProvider, MemoryRegistryCenter, RegistryBackend};
pub use command::{CommandDriver, CommandServiceManager, RoutingCommand};
pub use config::RegistryConfig;
pub use console::{Page, PageRequest, RegistryConsole, UrlFilter};
pub use error::{
    BackendError, CommandError, ConfigError, ConsoleError, RegistryError, RegistryOperation,
    UrlParseError,
};
pub use listener::{CommandListener, NotifyListener, RecordingListener, ServiceListener};
pub use provider::{LocalExporter, ProviderInvoker, Request, Response, RpcException};
pub use registry::{FailbackRegistry, Registry, RegistryCore, RegistryFactory, SubscriptionSnapshot};
pub use switch::HeartbeatSwitch;
pub use url::ServiceUrl;
