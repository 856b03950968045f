//! URL 参数键、默认值与节点类型常量。
//!
//! # 教案式说明
//! - **意图（Why）**：注册、订阅、指令路由与本地调用四条链路都通过 [`ServiceUrl`](crate::url::ServiceUrl)
//!   的参数表交换信息，键名散落在各模块会导致拼写漂移；集中声明后由编译器保证一致。
//! - **契约（What）**：键名与注册中心上的存量数据保持字节级兼容，修改任何常量都等同于修改线上协议。

/// 框架默认协议名。
pub const DEFAULT_PROTOCOL: &str = "infinity";
/// 指令路由生成的权重伪 URL 所用协议。
pub const RULE_PROTOCOL: &str = "rule";
/// 内存注册中心协议名。
pub const MEMORY_REGISTRY_PROTOCOL: &str = "memory";

pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const NODE_TYPE_KEY: &str = "nodeType";
pub const CODEC_KEY: &str = "codec";
pub const WEIGHTS_KEY: &str = "weights";
pub const CHECK_KEY: &str = "check";
pub const RETRY_PERIOD_KEY: &str = "retryPeriod";
pub const APPLICATION_KEY: &str = "application";
pub const TRANSMIT_EXCEPTION_STACK_KEY: &str = "transExceptionStack";
pub const LOCAL_IP_KEY: &str = "localIp";
pub const COMMAND_KEY: &str = "command";

pub const DEFAULT_GROUP: &str = "default_rpc";
pub const DEFAULT_VERSION: &str = "1.0";
pub const DEFAULT_CODEC: &str = "infinity";

/// 默认重试周期（毫秒）。
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 30_000;

/// 节点类型：服务提供方。
pub const NODE_TYPE_SERVICE: &str = "service";
/// 节点类型：服务消费方。
pub const NODE_TYPE_REFERER: &str = "referer";
/// 节点类型：应用级提供方标记。
pub const NODE_TYPE_APPLICATION_PROVIDER: &str = "application-provider";

/// 注册前需要剥离的注册中心内部参数。
pub const REGISTRY_INTERNAL_KEYS: &[&str] = &[CODEC_KEY];
