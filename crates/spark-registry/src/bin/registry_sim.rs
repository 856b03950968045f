//! 注册中心宕机与恢复的演练程序。
//!
//! # 使用方法
//! ```bash
//! cargo run --bin registry-sim -- --config registry.toml --cycles 3
//! ```
//! - `--config`：可选，`RegistryConfig` 的 TOML 文件；缺省使用内置默认值。
//! - `--cycles`：可选，注册中心宕机期间执行的重试轮数，默认 3。
//!
//! # 演练过程（What）
//! 1. 内存注册中心先处于宕机状态，提供方注册与消费方订阅都进入失败队列；
//! 2. 执行若干轮重试，每轮都失败并重新排队；
//! 3. 注册中心恢复后再执行一轮重试，提供方变为可用，消费方收到推送；
//! 4. 打印注册中心上的提供方集合与消费方最后收到的列表。

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use spark_registry::constants::{NODE_TYPE_KEY, NODE_TYPE_REFERER};
use spark_registry::provider::{ServiceDefinition, ServiceExporter};
use spark_registry::{
    LocalExporter, MemoryCenterProvider, NotifyListener, ProviderInvoker, RecordingListener,
    Registry, RegistryConfig, RegistryFactory, ServiceUrl, telemetry,
};

const REGISTRY_URL: &str = "memory://127.0.0.1:2181";
const SERVICE_PATH: &str = "com.acme.EchoService";

fn main() {
    if let Err(error) = run() {
        eprintln!("registry-sim 失败: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut config_path = None;
    let mut cycles = 3usize;
    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| usage("--config 之后必须提供文件路径"))?;
                config_path = Some(PathBuf::from(value));
            }
            "--cycles" => {
                let value = args
                    .next()
                    .ok_or_else(|| usage("--cycles 之后必须提供次数"))?;
                cycles = value
                    .parse()
                    .map_err(|_| usage(&format!("--cycles 不是合法次数: {value}")))?;
            }
            unknown => return Err(usage(&format!("未知参数: {unknown}"))),
        }
    }

    let config = match config_path {
        Some(path) => RegistryConfig::load(&path).map_err(|err| err.to_string())?,
        None => RegistryConfig::default(),
    };
    telemetry::install("info").map_err(|err| err.to_string())?;

    let registry_url = ServiceUrl::parse(REGISTRY_URL).map_err(|err| err.to_string())?;
    let centers = MemoryCenterProvider::new();
    let center = centers.get_or_create(&registry_url);
    center.set_online(false);
    info!(registry = REGISTRY_URL, "registry center is down");

    let factory = RegistryFactory::new(centers.clone(), config.clone());
    let exporter = LocalExporter::new();
    let definition = ServiceDefinition::builder(SERVICE_PATH)
        .method("echo", &["string"], |args| {
            Ok(args.first().cloned().unwrap_or(json!(null)))
        })
        .build();
    let provider_url = ServiceUrl::new("infinity", "10.0.0.5", 26000, SERVICE_PATH);
    let invoker = ProviderInvoker::with_config(provider_url, definition, &config);
    invoker
        .register(
            "registry-sim",
            exporter.as_ref() as &dyn ServiceExporter,
            &factory,
            std::slice::from_ref(&registry_url),
        )
        .map_err(|err| err.to_string())?;

    let registry = factory
        .get_registry(&registry_url)
        .map_err(|err| err.to_string())?;
    let consumer = RecordingListener::new();
    let client = ServiceUrl::new("infinity", "10.0.0.9", 0, SERVICE_PATH)
        .with_parameter(NODE_TYPE_KEY, NODE_TYPE_REFERER);
    registry
        .subscribe(&client, consumer.clone() as Arc<dyn NotifyListener>)
        .map_err(|err| err.to_string())?;

    for cycle in 1..=cycles {
        registry.retry();
        println!(
            "cycle {cycle}: pending failures = {}, register attempts = {}",
            registry.pending_failures(),
            center.calls("register")
        );
    }

    center.set_online(true);
    info!(registry = REGISTRY_URL, "registry center recovered");
    registry.retry();

    println!("pending failures after recovery = {}", registry.pending_failures());
    println!("registered intents:");
    for url in registry.registered_urls() {
        println!("  {url}");
    }
    println!("providers on the center:");
    for url in center.providers(client.group(), SERVICE_PATH) {
        println!("  {url}");
    }
    println!("consumer view:");
    for url in consumer.last().unwrap_or_default() {
        println!("  {url}");
    }

    factory.shutdown();
    Ok(())
}

fn usage(reason: &str) -> String {
    format!("{reason}\n用法: registry-sim [--config <registry.toml>] [--cycles <n>]")
}
