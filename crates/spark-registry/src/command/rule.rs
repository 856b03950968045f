//! 路由指令中的三种小语法：路径模式、`group:weight` 权重与 `from to to` IP 规则。

use crate::constants::RULE_PROTOCOL;
use crate::error::CommandError;
use crate::url::ServiceUrl;

/// 未写权重时的默认值。
pub const DEFAULT_WEIGHT: u8 = 1;
/// 权重上限（含）。
pub const MAX_WEIGHT: i64 = 100;

/// `*` 匹配任意字符序列（含空），其余字符逐字比较。
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim();
    if !pattern.contains('*') {
        return pattern == path;
    }
    let mut parts = pattern.split('*');
    let Some(head) = parts.next() else {
        return true;
    };
    let Some(mut rest) = path.strip_prefix(head) else {
        return false;
    };
    let segments: Vec<&str> = parts.collect();
    let Some((tail, middle)) = segments.split_last() else {
        return true;
    };
    for segment in middle {
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    rest.len() >= tail.len() && rest.ends_with(tail)
}

/// 一个合并分组及其权重。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupWeight {
    pub group: String,
    pub weight: u8,
}

/// 解析 `group[:weight]` 列表；重复的分组以最后一次为准，保留首次出现的位置。
///
/// 任一权重非整数或超出 `[0, 100]` 时整体失败。
pub fn parse_weights(tokens: &[String]) -> Result<Vec<GroupWeight>, CommandError> {
    let mut weights: Vec<GroupWeight> = Vec::with_capacity(tokens.len());
    for token in tokens {
        let token = token.trim();
        let (group, weight) = match token.split_once(':') {
            Some((group, raw)) => {
                let weight: i64 = raw.trim().parse().map_err(|_| CommandError::InvalidWeight {
                    token: token.to_owned(),
                })?;
                (group.trim(), weight)
            }
            None => (token, i64::from(DEFAULT_WEIGHT)),
        };
        if group.is_empty() {
            return Err(CommandError::EmptyGroup {
                token: token.to_owned(),
            });
        }
        let weight = u8::try_from(weight)
            .ok()
            .filter(|weight| i64::from(*weight) <= MAX_WEIGHT)
            .ok_or_else(|| CommandError::WeightOutOfRange {
                group: group.to_owned(),
                weight,
            })?;
        match weights.iter_mut().find(|existing| existing.group == group) {
            Some(existing) => existing.weight = weight,
            None => weights.push(GroupWeight {
                group: group.to_owned(),
                weight,
            }),
        }
    }
    Ok(weights)
}

/// 序列化为 `g1:w1,g2:w2`，写入权重伪 URL 的 `weights` 参数。
pub fn format_weights(weights: &[GroupWeight]) -> String {
    weights
        .iter()
        .map(|entry| format!("{}:{}", entry.group, entry.weight))
        .collect::<Vec<_>>()
        .join(",")
}

/// 规则一侧的 IP 模式：可选前导 `!` 取反，可选尾部 `*` 表示前缀匹配。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpPattern {
    negated: bool,
    prefix: String,
    wildcard: bool,
}

impl IpPattern {
    fn parse(raw: &str) -> Option<Self> {
        let (negated, body) = match raw.strip_prefix('!') {
            Some(body) => (true, body),
            None => (false, raw),
        };
        let (prefix, wildcard) = match body.strip_suffix('*') {
            Some(prefix) => (prefix, true),
            None => (body, false),
        };
        let well_formed = prefix.chars().all(|c| c.is_ascii_digit() || c == '.')
            && (wildcard || !prefix.is_empty());
        well_formed.then(|| Self {
            negated,
            prefix: prefix.to_owned(),
            wildcard,
        })
    }

    pub fn matches(&self, ip: &str) -> bool {
        let hit = if self.wildcard {
            ip.starts_with(&self.prefix)
        } else {
            ip == self.prefix
        };
        hit != self.negated
    }
}

/// `from to to` 路由规则。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub from: IpPattern,
    pub to: IpPattern,
}

impl RouteRule {
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let malformed = || CommandError::InvalidRouteRule {
            rule: raw.to_owned(),
        };
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let sides: Vec<&str> = normalized.split(" to ").collect();
        let [from, to] = sides.as_slice() else {
            return Err(malformed());
        };
        let from = IpPattern::parse(from.trim()).ok_or_else(malformed)?;
        let to = IpPattern::parse(to.trim()).ok_or_else(malformed)?;
        Ok(Self { from, to })
    }

    /// 本机命中 `from` 时，只保留主机命中 `to` 的地址；权重伪 URL 永远保留。
    pub fn apply(&self, local_ip: &str, urls: &mut Vec<ServiceUrl>) {
        if !self.from.matches(local_ip) {
            return;
        }
        urls.retain(|url| url.protocol() == RULE_PROTOCOL || self.to.matches(url.host()));
    }
}
