//! 路由指令的结构化表示。
//!
//! 注册中心推送的指令原文是 JSON：
//!
//! ```json
//! {"clientCommandList": [
//!   {"index": 1, "pattern": "com.acme.*", "mergeGroups": ["g1:2", "g2:1"],
//!    "routeRules": ["10.1.* to 10.2.*"], "version": "1.0", "dc": "yf",
//!    "commandType": 0, "remark": "shift traffic"}
//! ]}
//! ```
//!
//! 只有 `pattern`、`mergeGroups`、`routeRules` 参与路由计算，其余字段随指令保留，供日志与控制台展示。

use serde::{Deserialize, Serialize};

use super::rule::pattern_matches;
use crate::error::CommandError;

/// 一条面向客户端的路由规则。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientCommand {
    /// 排序键，数值小者优先；相同时保持原文顺序。
    pub index: i64,
    pub version: Option<String>,
    pub dc: Option<String>,
    pub command_type: Option<i64>,
    /// 服务路径匹配模式，`*` 匹配任意字符序列。
    pub pattern: String,
    /// `group[:weight]` 形式的合并分组。
    pub merge_groups: Vec<String>,
    /// `from to to` 形式的 IP 路由规则。
    pub route_rules: Vec<String>,
    pub remark: Option<String>,
}

impl ClientCommand {
    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.pattern, path)
    }
}

/// 解析后的路由指令。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingCommand {
    pub client_command_list: Vec<ClientCommand>,
}

impl RoutingCommand {
    /// 解析指令原文，并按 `index` 稳定排序。
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let mut command: Self =
            serde_json::from_str(text).map_err(|err| CommandError::Malformed {
                detail: err.to_string(),
            })?;
        command.client_command_list.sort_by_key(|entry| entry.index);
        Ok(command)
    }

    pub fn entries(&self) -> &[ClientCommand] {
        &self.client_command_list
    }

    /// 第一个匹配路径的条目。
    pub fn first_match(&self, path: &str) -> Option<&ClientCommand> {
        self.client_command_list
            .iter()
            .find(|entry| entry.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sorts_by_index_and_keeps_metadata() {
        let command = RoutingCommand::parse(
            r#"{"clientCommandList":[
                {"index":2,"pattern":"*","mergeGroups":["b"]},
                {"index":1,"pattern":"com.acme.*","mergeGroups":["a:3"],"dc":"yf","remark":"r"}
            ]}"#,
        )
        .expect("合法指令应能解析");
        assert_eq!(command.entries()[0].pattern, "com.acme.*");
        assert_eq!(command.entries()[0].dc.as_deref(), Some("yf"));
        assert_eq!(
            command.first_match("com.acme.FooService").map(|e| e.index),
            Some(1)
        );
        assert_eq!(command.first_match("org.other.Bar").map(|e| e.index), Some(2));
    }

    #[test]
    fn parse_rejects_non_json() {
        let err = RoutingCommand::parse("not json").expect_err("非 JSON 应报错");
        assert_eq!(err.code(), "registry.command.malformed");
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let command = RoutingCommand::parse(r#"{"clientCommandList":[{"pattern":"*"}]}"#)
            .expect("缺省字段应取默认值");
        assert!(command.entries()[0].merge_groups.is_empty());
        assert!(command.entries()[0].route_rules.is_empty());
    }
}
