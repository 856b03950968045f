//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为注册中心客户端层对外暴露的错误语义提供集中定义；
//! - 区分四类失败：输入格式错误、注册中心瞬时故障、业务调用失败（见 [`crate::provider`]）、配置错误。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，兼容 `std::error::Error`；
//! - 每个枚举提供 `code()`，返回 `registry.*` 命名空间下的稳定错误码，供告警与指标聚合；
//! - 注册中心故障（[`BackendError`]）在失败回退模式下不会越过注册层，只有 `check=true` 时才原样交给调用方。

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// 规范 URL 字符串解析失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum UrlParseError {
    #[error("url string is empty")]
    Empty,
    #[error("url `{input}` has no protocol")]
    MissingProtocol { input: String },
    #[error("url `{input}` has no host")]
    MissingHost { input: String },
    #[error("url `{input}` has no port")]
    MissingPort { input: String },
    #[error("url `{input}` has an invalid port `{port}`")]
    InvalidPort { input: String, port: String },
}

impl UrlParseError {
    pub fn code(&self) -> &'static str {
        "registry.url.malformed"
    }
}

/// 路由指令解析或校验失败。
///
/// - **契约（What）**：这些错误只会被记录日志，随后路由回退到“仅使用本分组”的基线行为，
///   不会让订阅方失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CommandError {
    /// 指令文本不是合法 JSON，或结构与预期不符。
    #[error("routing command is malformed: {detail}")]
    Malformed { detail: String },
    /// `group:weight` 中的权重不是整数。
    #[error("merge token `{token}` carries a non-numeric weight")]
    InvalidWeight { token: String },
    /// 权重超出 `[0, 100]`。
    #[error("merge group `{group}` weight {weight} is outside [0, 100]")]
    WeightOutOfRange { group: String, weight: i64 },
    /// `group:weight` 的分组名为空。
    #[error("merge token `{token}` has an empty group name")]
    EmptyGroup { token: String },
    /// `from to to` 路由规则的形态或 IP 模式不合法。
    #[error("route rule `{rule}` is malformed")]
    InvalidRouteRule { rule: String },
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Malformed { .. } => "registry.command.malformed",
            CommandError::InvalidWeight { .. }
            | CommandError::WeightOutOfRange { .. }
            | CommandError::EmptyGroup { .. } => "registry.command.invalid_weight",
            CommandError::InvalidRouteRule { .. } => "registry.command.invalid_route_rule",
        }
    }
}

/// 注册中心驱动返回的传输层失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BackendError {
    /// 注册中心暂时不可达，失败回退层会排队重试。
    #[error("registry center unavailable: {detail}")]
    Unavailable { detail: String },
    /// 注册中心明确拒绝了请求。
    #[error("registry center rejected the request: {detail}")]
    Rejected { detail: String },
    /// 驱动已关闭。
    #[error("registry backend is closed")]
    Closed,
}

impl BackendError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        BackendError::Unavailable {
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Unavailable { .. } => "registry.backend.unavailable",
            BackendError::Rejected { .. } => "registry.backend.rejected",
            BackendError::Closed => "registry.backend.closed",
        }
    }
}

/// 注册层操作种类，用于错误上下文与日志字段。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RegistryOperation {
    Connect,
    Register,
    Unregister,
    Subscribe,
    Unsubscribe,
    Discover,
    Available,
    Unavailable,
}

impl RegistryOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryOperation::Connect => "connect",
            RegistryOperation::Register => "register",
            RegistryOperation::Unregister => "unregister",
            RegistryOperation::Subscribe => "subscribe",
            RegistryOperation::Unsubscribe => "unsubscribe",
            RegistryOperation::Discover => "discover",
            RegistryOperation::Available => "available",
            RegistryOperation::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for RegistryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册层对外的失败类型。
///
/// # 教案式说明
/// - **意图（Why）**：驱动错误本身不带“哪次操作、哪个 URL”的上下文，包装后调用方无需再拼接；
/// - **契约（What）**：`Backend` 保留底层 [`BackendError`] 作为 `source`；`Closed` 表示注册实例已销毁。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum RegistryError {
    #[error("failed to {operation} `{url}` on registry `{registry}`: {source}")]
    Backend {
        operation: RegistryOperation,
        registry: String,
        url: String,
        #[source]
        source: BackendError,
    },
    #[error("registry `{registry}` is closed")]
    Closed { registry: String },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Backend { source, .. } => source.code(),
            RegistryError::Closed { .. } => "registry.closed",
        }
    }

    pub fn operation(&self) -> Option<RegistryOperation> {
        match self {
            RegistryError::Backend { operation, .. } => Some(*operation),
            RegistryError::Closed { .. } => None,
        }
    }
}

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config key `{key}` has an invalid value `{value}`")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "registry.config.io",
            ConfigError::Toml(_) => "registry.config.syntax",
            ConfigError::InvalidValue { .. } => "registry.config.invalid_value",
        }
    }
}

/// 管理控制台调用本层时的失败。
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("no live registry for `{registry}`")]
    RegistryNotFound { registry: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Url(#[from] UrlParseError),
    #[error("arguments for `{method}` are not a JSON array: {detail}")]
    InvalidArguments { method: String, detail: String },
    #[error("remote invocation of `{method}` failed: {detail}")]
    Invocation { method: String, detail: String },
}

impl ConsoleError {
    pub fn code(&self) -> &'static str {
        match self {
            ConsoleError::RegistryNotFound { .. } => "registry.console.not_found",
            ConsoleError::Registry(err) => err.code(),
            ConsoleError::Url(err) => err.code(),
            ConsoleError::InvalidArguments { .. } => "registry.console.invalid_arguments",
            ConsoleError::Invocation { .. } => "registry.console.invocation",
        }
    }
}
