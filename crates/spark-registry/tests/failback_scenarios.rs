//! 失败回退与心跳场景：注册中心宕机、恢复与可用性扫描。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：注册中心宕机期间，注册意图与订阅必须保留在本地并按周期重试；
//!   恢复后一轮重试即可收敛，且整个过程中同一身份只有一条注册意图。
//! - **结构 (How)**：测试经由 `RegistryFactory` 组装实例，手动调用 `retry()` 驱动重试轮次，
//!   重试周期保持默认值，避免后台线程干扰计数。

use std::sync::Arc;

use serde_json::json;
use spark_registry::provider::{ServiceDefinition, ServiceExporter};
use spark_registry::registry::RegistrationState;
use spark_registry::{
    FailbackRegistry, LocalExporter, MemoryCenterProvider, MemoryRegistryCenter, NotifyListener,
    ProviderInvoker, RecordingListener, Registry, RegistryConfig, RegistryFactory, ServiceUrl,
};

const PATH: &str = "com.acme.FooService";

fn setup(registry: &str) -> (Arc<MemoryRegistryCenter>, ServiceUrl, RegistryFactory) {
    let centers = MemoryCenterProvider::new();
    let registry_url = ServiceUrl::parse(registry).expect("注册中心 URL 应可解析");
    let center = centers.get_or_create(&registry_url);
    let factory = RegistryFactory::new(centers, RegistryConfig::default());
    (center, registry_url, factory)
}

fn provider_url() -> ServiceUrl {
    ServiceUrl::new("infinity", "10.0.0.5", 26000, PATH)
}

fn invoker() -> Arc<ProviderInvoker> {
    let definition = ServiceDefinition::builder(PATH)
        .method("ping", &[], |_| Ok(json!("pong")))
        .build();
    ProviderInvoker::new(provider_url(), definition)
}

fn intents(registry: &FailbackRegistry) -> usize {
    let identity = provider_url().identity();
    registry
        .registered_urls()
        .iter()
        .filter(|url| url.identity() == identity)
        .count()
}

#[test]
fn outage_then_recovery_converges_with_a_single_intent() {
    let (center, registry_url, factory) = setup("memory://127.0.0.1:2181?command=false");
    center.set_online(false);

    let exporter = LocalExporter::new();
    let invoker = invoker();
    invoker
        .register(
            "demo-app",
            exporter.as_ref() as &dyn ServiceExporter,
            &factory,
            std::slice::from_ref(&registry_url),
        )
        .expect("check=false 时宕机不应让注册失败");
    assert!(invoker.is_active());
    assert!(factory.switch().is_on());
    assert_eq!(exporter.len(), 1);

    let registry = factory.lookup(&registry_url).expect("注册实例应已创建");

    for cycle in 1..=3 {
        registry.retry();
        assert_eq!(registry.failed_registered().len(), 2, "第 {cycle} 轮后仍应排队");
        assert_eq!(intents(&registry), 1);
    }
    // 服务 URL 与应用标记各一次首次注册，加三轮重试。
    assert_eq!(center.calls("register"), 8);
    assert!(center.registrations("default_rpc", PATH).is_empty());

    center.set_online(true);
    registry.retry();
    assert_eq!(registry.pending_failures(), 0);
    assert_eq!(intents(&registry), 1);
    assert_eq!(
        registry.core().registration_state(&provider_url()),
        Some(RegistrationState::Available)
    );
    let providers = center.providers("default_rpc", PATH);
    assert!(providers.contains(&provider_url()));
    assert!(
        providers
            .iter()
            .any(|url| url.get_parameter("application") == Some("demo-app"))
    );
}

#[test]
fn repeated_register_is_idempotent_per_identity() {
    let (center, registry_url, factory) = setup("memory://127.0.0.1:2181?command=false");
    let registry = factory.get_registry(&registry_url).expect("创建注册实例");
    center.set_online(false);
    for _ in 0..3 {
        registry.register(&provider_url()).expect("排队");
        registry
            .register(&provider_url().with_parameter("codec", "hessian"))
            .expect("codec 不影响身份");
    }
    assert_eq!(registry.failed_registered().len(), 1);
    assert_eq!(registry.registered_urls().len(), 1);
    assert_eq!(
        registry.registered_urls()[0].get_parameter("codec"),
        None,
        "注册中心内部参数应被剥离"
    );
}

#[test]
fn unregister_during_outage_is_retried() {
    let (center, registry_url, factory) = setup("memory://127.0.0.1:2181?command=false");
    let registry = factory.get_registry(&registry_url).expect("创建注册实例");
    registry.register(&provider_url()).expect("注册");
    assert_eq!(center.registrations("default_rpc", PATH).len(), 1);

    center.set_online(false);
    registry.unregister(&provider_url()).expect("排队");
    assert!(registry.registered_urls().is_empty());
    assert_eq!(registry.failed_unregistered().len(), 1);

    center.set_online(true);
    registry.retry();
    assert!(registry.failed_unregistered().is_empty());
    assert!(center.registrations("default_rpc", PATH).is_empty());
}

#[test]
fn heartbeat_switch_moves_registrations_but_respects_explicit_unavailable() {
    let (center, registry_url, factory) = setup("memory://127.0.0.1:2181?command=false");
    let registry = factory.get_registry(&registry_url).expect("创建注册实例");
    let other = ServiceUrl::new("infinity", "10.0.0.6", 26000, PATH);
    registry.register(&provider_url()).expect("注册");
    registry.register(&other).expect("注册");
    assert!(center.providers("default_rpc", PATH).is_empty(), "开关打开前不可用");

    factory.switch().turn_on();
    assert_eq!(center.providers("default_rpc", PATH).len(), 2);

    registry.unavailable(&other).expect("显式下线");
    factory.switch().turn_off();
    factory.switch().turn_on();
    assert_eq!(center.providers("default_rpc", PATH), vec![provider_url()]);
    assert_eq!(
        registry.core().registration_state(&other),
        Some(RegistrationState::Unavailable)
    );

    registry.available(&other).expect("显式上线");
    assert_eq!(center.providers("default_rpc", PATH).len(), 2);
}

#[test]
fn subscriber_receives_providers_after_recovery() {
    let (center, registry_url, factory) = setup("memory://127.0.0.1:2181?command=false");
    let registry = factory.get_registry(&registry_url).expect("创建注册实例");
    factory.switch().turn_on();
    registry.register(&provider_url()).expect("注册");

    center.set_online(false);
    let listener = RecordingListener::new();
    let client = ServiceUrl::new("infinity", "10.0.0.9", 0, PATH).with_parameter("nodeType", "referer");
    registry
        .subscribe(&client, listener.clone() as Arc<dyn NotifyListener>)
        .expect("排队");
    assert_eq!(listener.count(), 0, "没有缓存时不回放");
    assert_eq!(registry.failed_subscribed().len(), 1);

    center.set_online(true);
    registry.retry();
    assert_eq!(listener.last(), Some(vec![provider_url()]));
    assert_eq!(registry.discover(&client), vec![provider_url()]);
}

#[test]
fn closed_registry_rejects_operations() {
    let (_center, registry_url, factory) = setup("memory://127.0.0.1:2181?command=false");
    let registry = factory.get_registry(&registry_url).expect("创建注册实例");
    factory.destroy_all();
    let err = registry.register(&provider_url()).expect_err("已关闭的实例应拒绝");
    assert_eq!(err.code(), "registry.closed");
    assert_eq!(registry.pending_failures(), 0);
}
