//! `ServiceUrl`：贯穿注册、订阅、路由与调用全链路的结构化地址描述。
//!
//! # 教案式说明
//! - **意图（Why）**：注册中心里的一条记录、消费方的一次订阅、指令路由产出的一条权重规则，
//!   在本层都表达为同一种值类型；各模块只读它，需要修改时先 [`ServiceUrl::copy`] 再写。
//! - **规范字符串（What）**：`protocol://host:port/path?k1=v1&k2=v2`；路径可以缺省（注册中心根 URL），
//!   查询串可以为空。参数键值中的 `%`、`&`、`=` 以 `%25`、`%26`、`%3D` 转义，其余字符原样输出。
//! - **身份（What）**：[`ServiceUrl::identity`] 由协议、`host:port`、分组、路径、版本与节点类型组成，
//!   用于已注册集合、失败队列的去重；它刻意不等价于结构相等，`codec` 等附加参数不会影响身份。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::constants::{
    DEFAULT_GROUP, DEFAULT_VERSION, GROUP_KEY, NODE_TYPE_KEY, NODE_TYPE_SERVICE, VERSION_KEY,
};
use crate::error::UrlParseError;

const SCHEME_SEPARATOR: &str = "://";

/// 查询串中需要转义的字符。
const ESCAPED: [(char, &str); 3] = [('%', "%25"), ('&', "%26"), ('=', "%3D")];

fn escape_component(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        match ESCAPED.iter().find(|(escaped, _)| *escaped == ch) {
            Some((_, encoded)) => out.push_str(encoded),
            None => out.push(ch),
        }
    }
}

/// 还原 [`escape_component`] 的输出；无法识别的 `%` 序列保持原样。
fn unescape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(index) = rest.find('%') {
        out.push_str(&rest[..index]);
        let tail = &rest[index..];
        let head = tail.get(..3).unwrap_or_default();
        match ESCAPED
            .iter()
            .find(|(_, encoded)| head.eq_ignore_ascii_case(encoded))
        {
            Some((ch, _)) => {
                out.push(*ch);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// 一个服务端点的结构化描述。
///
/// # 契约说明（What）
/// - `protocol`、`host`、`port` 构造后恒存在；`path` 仅在注册中心根 URL 中允许为空；
/// - 参数表永不为空引用，构造时写入默认分组 [`DEFAULT_GROUP`]；
/// - 参数表使用 [`BTreeMap`]，保证 [`ServiceUrl::to_full_string`] 的输出顺序稳定，便于日志比对与缓存键复用；
/// - `Clone` 即深拷贝：两个实例之间从不共享参数表。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceUrl {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl ServiceUrl {
    /// 以显式字段构造 URL，并写入默认分组。
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(GROUP_KEY.to_owned(), DEFAULT_GROUP.to_owned());
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: path.into().trim_start_matches('/').to_owned(),
            parameters,
        }
    }

    /// 解析规范字符串。
    ///
    /// # 契约（What）
    /// - 协议、主机、端口任一缺失或端口非 `u16` 时返回 [`UrlParseError`]；
    /// - 查询串中键或值为空白的条目被忽略，与 [`ServiceUrl::add_parameter`] 的静默语义一致；
    /// - 同名参数以最后一次出现为准；
    /// - 键值中的转义序列在写入参数表前还原。
    pub fn parse(raw: &str) -> Result<Self, UrlParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UrlParseError::Empty);
        }
        let (protocol, rest) = raw
            .split_once(SCHEME_SEPARATOR)
            .ok_or_else(|| UrlParseError::MissingProtocol {
                input: raw.to_owned(),
            })?;
        if protocol.is_empty() {
            return Err(UrlParseError::MissingProtocol {
                input: raw.to_owned(),
            });
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, query),
            None => (rest, ""),
        };
        let (authority, path) = match location.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (location, ""),
        };

        let (host, port) =
            authority
                .rsplit_once(':')
                .ok_or_else(|| UrlParseError::MissingPort {
                    input: raw.to_owned(),
                })?;
        if host.is_empty() {
            return Err(UrlParseError::MissingHost {
                input: raw.to_owned(),
            });
        }
        let port = port.parse::<u16>().map_err(|_| UrlParseError::InvalidPort {
            input: raw.to_owned(),
            port: port.to_owned(),
        })?;

        let mut url = Self::new(protocol, host, port, path);
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            url.add_parameter(unescape_component(key), unescape_component(value));
        }
        Ok(url)
    }

    /// 深拷贝。
    ///
    /// 跨模块传递或修改前必须调用；返回值与原实例读操作完全一致，但不共享参数表。
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// `host:port` 形式的地址。
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 不含参数的 `protocol://host:port/path`。
    pub fn uri(&self) -> String {
        format!(
            "{}{}{}:{}/{}",
            self.protocol, SCHEME_SEPARATOR, self.host, self.port, self.path
        )
    }

    /// 完整规范字符串，可被 [`ServiceUrl::parse`] 还原为结构相等的 URL。
    pub fn to_full_string(&self) -> String {
        let mut out = self.uri();
        if !self.parameters.is_empty() {
            out.push('?');
            let mut first = true;
            for (key, value) in &self.parameters {
                if !first {
                    out.push('&');
                }
                first = false;
                escape_component(key, &mut out);
                out.push('=');
                escape_component(value, &mut out);
            }
        }
        out
    }

    /// 注册身份：`protocol://host:port/group/path/version/nodeType`。
    pub fn identity(&self) -> String {
        format!(
            "{}{}{}:{}/{}/{}/{}/{}",
            self.protocol,
            SCHEME_SEPARATOR,
            self.host,
            self.port,
            self.group(),
            self.path,
            self.version(),
            self.node_type()
        )
    }

    /// 两个 URL 是否代表同一条注册。
    pub fn is_same_registration(&self, other: &ServiceUrl) -> bool {
        self.identity() == other.identity()
    }

    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn get_parameter_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get_parameter(name).unwrap_or(default)
    }

    /// 读取整数参数；缺失或无法解析时返回 `default`。
    pub fn get_int_parameter(&self, name: &str, default: i64) -> i64 {
        self.get_parameter(name)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// 读取布尔参数，只接受 `true`/`false`（大小写不敏感），其余取 `default`。
    pub fn get_bool_parameter(&self, name: &str, default: bool) -> bool {
        match self.get_parameter(name).map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            _ => default,
        }
    }

    /// 写入参数。
    ///
    /// 名称或值为空白时静默忽略，不报错：调用方依赖这一点按条件拼装参数。
    pub fn add_parameter(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        let (name, value) = (name.as_ref(), value.as_ref());
        if name.trim().is_empty() || value.trim().is_empty() {
            return;
        }
        self.parameters.insert(name.to_owned(), value.to_owned());
    }

    /// 链式版本的 [`ServiceUrl::add_parameter`]。
    #[must_use]
    pub fn with_parameter(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.add_parameter(name, value);
        self
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<String> {
        self.parameters.remove(name)
    }

    pub fn group(&self) -> &str {
        self.get_parameter_or(GROUP_KEY, DEFAULT_GROUP)
    }

    pub fn version(&self) -> &str {
        self.get_parameter_or(VERSION_KEY, DEFAULT_VERSION)
    }

    pub fn node_type(&self) -> &str {
        self.get_parameter_or(NODE_TYPE_KEY, NODE_TYPE_SERVICE)
    }

    /// 复制一份并改写分组，指令路由按组订阅时使用。
    #[must_use]
    pub fn copy_with_group(&self, group: &str) -> Self {
        self.copy().with_parameter(GROUP_KEY, group)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_full_string())
    }
}

impl FromStr for ServiceUrl {
    type Err = UrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
