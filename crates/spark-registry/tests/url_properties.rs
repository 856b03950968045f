//! `ServiceUrl` 性质验证。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：规范字符串是注册中心上的存量数据格式，解析与输出必须互为逆运算；
//!   `copy` 之后的修改不得影响原实例，否则失败队列与订阅缓存会被意外改写。
//! - **设计手法 (How)**：用 Proptest 生成协议、主机、端口、路径与参数表，覆盖默认分组与自定义分组两种情形。
//! - **合同 (What)**：普通键值取自不含空白的标识符字符集；另有一组性质专门生成含 `%`、`&`、`=` 的值，
//!   验证转义后仍能还原。

use std::collections::BTreeMap;

use proptest::prelude::*;
use spark_registry::ServiceUrl;

fn token() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_.-]{0,11}"
}

fn url_strategy() -> impl Strategy<Value = ServiceUrl> {
    (
        "[a-z]{2,8}",
        "[a-z0-9]{1,8}(\\.[a-z0-9]{1,8}){0,3}",
        any::<u16>(),
        prop::collection::vec(token(), 0..3),
        prop::collection::btree_map(token(), token(), 0..5),
    )
        .prop_map(|(protocol, host, port, segments, params)| {
            let mut url = ServiceUrl::new(protocol, host, port, segments.join("/"));
            for (key, value) in params {
                url.add_parameter(key, value);
            }
            url
        })
}

proptest! {
    #[test]
    fn prop_full_string_round_trips(url in url_strategy()) {
        let parsed = ServiceUrl::parse(&url.to_full_string()).expect("规范字符串应可解析");
        prop_assert_eq!(&parsed, &url);
        prop_assert_eq!(parsed.identity(), url.identity());
    }

    #[test]
    fn prop_reserved_characters_round_trip(
        url in url_strategy(),
        key in "[a-z][a-z0-9&=%]{0,8}",
        value in "[a-zA-Z0-9&=%]{1,12}",
    ) {
        let url = url.with_parameter(&key, &value);
        let parsed = ServiceUrl::parse(&url.to_full_string()).expect("转义后的规范字符串应可解析");
        prop_assert_eq!(parsed.get_parameter(&key), Some(value.as_str()));
        prop_assert_eq!(&parsed, &url);
    }

    #[test]
    fn prop_copy_is_isolated(url in url_strategy(), key in token(), value in token()) {
        let before: BTreeMap<String, String> = url.parameters().clone();
        let mut copy = url.copy();
        copy.add_parameter(format!("x-{key}"), &value);
        copy.remove_parameter("group");
        prop_assert_eq!(url.parameters(), &before);
        prop_assert_eq!(copy.get_parameter(&format!("x-{key}")), Some(value.as_str()));
    }

    #[test]
    fn prop_blank_parameters_are_ignored(url in url_strategy(), key in token()) {
        let mut copy = url.copy();
        copy.add_parameter(&key, "  ");
        copy.add_parameter("  ", "value");
        prop_assert_eq!(copy, url);
    }
}

#[test]
fn identity_ignores_codec_but_not_node_type() {
    let base = ServiceUrl::parse("infinity://10.0.0.1:26000/com.acme.FooService?version=2.0")
        .expect("解析");
    let with_codec = base.copy().with_parameter("codec", "hessian");
    let referer = base.copy().with_parameter("nodeType", "referer");
    assert!(base.is_same_registration(&with_codec));
    assert!(!base.is_same_registration(&referer));
    assert_eq!(
        base.identity(),
        "infinity://10.0.0.1:26000/default_rpc/com.acme.FooService/2.0/service"
    );
}

#[test]
fn malformed_strings_are_rejected() {
    for raw in ["", "10.0.0.1:80/svc", "infinity://:80/svc", "infinity://host/svc", "infinity://host:99999/svc"] {
        assert!(ServiceUrl::parse(raw).is_err(), "`{raw}` 应解析失败");
    }
}
