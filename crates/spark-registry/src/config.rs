//! 注册层配置。
//!
//! # 教案式说明
//! - **来源（What）**：TOML 文件提供进程级默认值；注册中心 URL 上的参数（`retryPeriod`、`check`、
//!   `localIp`、`command`）逐项覆盖文件值，因此单独一条注册中心 URL 也是完整配置。
//! - **校验（How）**：`serde(default)` 填补缺失字段；URL 参数在覆盖时严格校验，非法值返回
//!   [`ConfigError::InvalidValue`]，而不是悄悄回落到默认值。

use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    CHECK_KEY, COMMAND_KEY, DEFAULT_RETRY_PERIOD_MS, LOCAL_IP_KEY, RETRY_PERIOD_KEY,
};
use crate::error::ConfigError;
use crate::url::ServiceUrl;

/// 本机地址探测失败时的回退值。
const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// 注册实例的运行参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// 失败重试周期（毫秒）。
    pub retry_period_ms: u64,
    /// 是否对注册中心故障快速失败。
    pub check: bool,
    /// 指令路由使用的本机出口 IP；缺省时自动探测。
    pub local_ip: Option<String>,
    /// 是否启用指令路由。
    pub command_enabled: bool,
    /// 提供方调用异常时是否默认向调用方传递异常栈。
    pub transmit_exception_stack: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retry_period_ms: DEFAULT_RETRY_PERIOD_MS,
            check: false,
            local_ip: None,
            command_enabled: true,
            transmit_exception_stack: true,
        }
    }
}

impl RegistryConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// 以默认值为基线，叠加注册中心 URL 参数。
    pub fn from_url(registry_url: &ServiceUrl) -> Result<Self, ConfigError> {
        Self::default().overlay_url(registry_url)
    }

    /// 以当前配置为基线，叠加注册中心 URL 参数。
    pub fn overlay_url(&self, registry_url: &ServiceUrl) -> Result<Self, ConfigError> {
        let mut merged = self.clone();
        if let Some(raw) = registry_url.get_parameter(RETRY_PERIOD_KEY) {
            merged.retry_period_ms = raw
                .trim()
                .parse()
                .map_err(|_| invalid(RETRY_PERIOD_KEY, raw))?;
        }
        if let Some(raw) = registry_url.get_parameter(CHECK_KEY) {
            merged.check = parse_bool(CHECK_KEY, raw)?;
        }
        if let Some(raw) = registry_url.get_parameter(COMMAND_KEY) {
            merged.command_enabled = parse_bool(COMMAND_KEY, raw)?;
        }
        if let Some(raw) = registry_url.get_parameter(LOCAL_IP_KEY) {
            merged.local_ip = Some(raw.trim().to_owned());
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    /// 指令路由使用的本机 IP：配置优先，其次通过 UDP 套接字探测到注册中心的出口地址。
    pub fn resolve_local_ip(&self, registry_url: &ServiceUrl) -> String {
        if let Some(ip) = &self.local_ip {
            return ip.clone();
        }
        let detected = detect_outbound_ip(registry_url).unwrap_or(LOOPBACK);
        debug!(registry = %registry_url.uri(), ip = %detected, "local ip detected");
        detected.to_string()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_period_ms == 0 {
            return Err(invalid("retry_period_ms", "0"));
        }
        if let Some(ip) = &self.local_ip {
            if ip.parse::<IpAddr>().is_err() {
                return Err(invalid(LOCAL_IP_KEY, ip));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim() {
        value if value.eq_ignore_ascii_case("true") => Ok(true),
        value if value.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(invalid(key, raw)),
    }
}

/// UDP `connect` 不发送数据，只让内核选路，从而得到出口地址。
fn detect_outbound_ip(registry_url: &ServiceUrl) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    let port = if registry_url.port() == 0 {
        80
    } else {
        registry_url.port()
    };
    socket.connect((registry_url.host(), port)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
