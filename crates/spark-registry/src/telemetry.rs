//! 日志订阅器安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：库代码只通过 `tracing` 宏输出结构化事件，是否以及如何落地由宿主决定；
//!   模拟程序与集成测试需要一个“一行安装”的入口。
//! - **逻辑（How）**：`registry() + EnvFilter + fmt::layer()` 组装全局订阅器；过滤指令依次取
//!   `SPARK_REGISTRY_LOG`、`RUST_LOG`，都不存在时使用调用方给出的默认指令。
//! - **契约（What）**：重复调用返回 [`TelemetryError::AlreadyInstalled`]；宿主已自行设置全局订阅器时返回
//!   [`TelemetryError::SubscriberAlreadySet`]。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// 覆盖默认过滤指令的环境变量。
pub const LOG_ENV: &str = "SPARK_REGISTRY_LOG";

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber has already been set")]
    SubscriberAlreadySet,
    #[error("failed to set the global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

impl TelemetryError {
    pub fn code(&self) -> &'static str {
        match self {
            TelemetryError::AlreadyInstalled => "registry.telemetry.already_installed",
            TelemetryError::SubscriberAlreadySet | TelemetryError::SetGlobalSubscriber(_) => {
                "registry.telemetry.subscriber_set"
            }
        }
    }
}

/// 安装全局订阅器。
pub fn install(default_directive: &str) -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_rejected() {
        // 同一测试进程内其他测试可能已经设置过订阅器，首个结果只要求不是 panic。
        let _ = install("warn");
        let err = install("warn").expect_err("重复安装应返回错误");
        assert!(matches!(
            err,
            TelemetryError::AlreadyInstalled | TelemetryError::SubscriberAlreadySet
        ));
    }
}
