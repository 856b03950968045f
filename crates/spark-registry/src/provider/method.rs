//! 显式方法表：`方法名 + 参数类型签名 → 处理函数`。
//!
//! # 教案式说明
//! - **意图（Why）**：服务接口在注册时一次性登记全部方法，调用时只做一次哈希查找；
//!   未登记的签名在查找阶段就能返回“方法不存在”，不会落到处理函数内部。
//! - **契约（What）**：
//!   - 同名方法按参数类型区分重载，签名写作 `name(t1,t2)`；
//!   - 处理函数以 [`ServiceFault`] 表达业务失败；方法可以声明自己会抛出的失败类型（`kind`），
//!     声明过的失败视为预期内的业务结果，日志降级且默认不向调用方传递异常栈。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 不传递异常栈时写入的占位帧。
pub const MASKED_FRAME: &str = "remoteClass.remoteMethod(remoteFile:1)";

/// 业务方法返回的失败。
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ServiceFault {
    /// 失败类型名，与方法声明的失败类型比较。
    pub kind: String,
    pub message: String,
    /// 服务端调用栈，由业务方自行填充。
    #[serde(default)]
    pub stack: Vec<String>,
}

impl ServiceFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_stack<S: Into<String>>(mut self, frames: impl IntoIterator<Item = S>) -> Self {
        self.stack = frames.into_iter().map(Into::into).collect();
        self
    }

    pub fn mask_stack(&mut self) {
        self.stack = vec![MASKED_FRAME.to_owned()];
    }
}

/// 方法处理函数。
pub type MethodHandler = Arc<dyn Fn(&[Value]) -> Result<Value, ServiceFault> + Send + Sync>;

/// 方法表中的一项。
pub struct MethodDescriptor {
    name: String,
    param_types: Vec<String>,
    declared_faults: Vec<String>,
    handler: MethodHandler,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_types(&self) -> &[String] {
        &self.param_types
    }

    pub fn signature(&self) -> String {
        signature(&self.name, &self.param_types)
    }

    /// 方法是否声明了该失败类型。
    pub fn declares(&self, kind: &str) -> bool {
        self.declared_faults.iter().any(|declared| declared == kind)
    }

    pub fn invoke(&self, arguments: &[Value]) -> Result<Value, ServiceFault> {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("signature", &self.signature())
            .field("declared_faults", &self.declared_faults)
            .finish()
    }
}

fn signature<S: AsRef<str>>(name: &str, param_types: &[S]) -> String {
    let types: Vec<&str> = param_types.iter().map(AsRef::as_ref).collect();
    format!("{}({})", name, types.join(","))
}

/// 一个服务接口的方法表。
#[derive(Debug)]
pub struct ServiceDefinition {
    interface: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceDefinition {
    pub fn builder(interface: impl Into<String>) -> ServiceDefinitionBuilder {
        ServiceDefinitionBuilder {
            definition: ServiceDefinition {
                interface: interface.into(),
                methods: HashMap::new(),
            },
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn lookup<S: AsRef<str>>(&self, name: &str, param_types: &[S]) -> Option<&MethodDescriptor> {
        self.methods.get(&signature(name, param_types))
    }

    /// 全部方法签名，按字典序。
    pub fn signatures(&self) -> Vec<String> {
        let mut signatures: Vec<String> = self.methods.keys().cloned().collect();
        signatures.sort();
        signatures
    }
}

/// [`ServiceDefinition`] 构造器。
pub struct ServiceDefinitionBuilder {
    definition: ServiceDefinition,
}

impl ServiceDefinitionBuilder {
    /// 登记一个不声明失败类型的方法。
    #[must_use]
    pub fn method<F>(self, name: &str, param_types: &[&str], handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ServiceFault> + Send + Sync + 'static,
    {
        self.method_with_faults(name, param_types, &[], handler)
    }

    /// 登记一个方法并声明它可能返回的失败类型；同一签名重复登记时后者覆盖前者。
    #[must_use]
    pub fn method_with_faults<F>(
        mut self,
        name: &str,
        param_types: &[&str],
        declared_faults: &[&str],
        handler: F,
    ) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ServiceFault> + Send + Sync + 'static,
    {
        let descriptor = MethodDescriptor {
            name: name.to_owned(),
            param_types: param_types.iter().map(|t| (*t).to_owned()).collect(),
            declared_faults: declared_faults.iter().map(|f| (*f).to_owned()).collect(),
            handler: Arc::new(handler),
        };
        self.definition
            .methods
            .insert(descriptor.signature(), descriptor);
        self
    }

    pub fn build(self) -> ServiceDefinition {
        self.definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overloads_are_distinguished_by_signature() {
        let definition = ServiceDefinition::builder("com.acme.FooService")
            .method("echo", &["string"], |args| Ok(args[0].clone()))
            .method("echo", &["string", "int"], |_| Ok(json!("two")))
            .build();
        assert_eq!(
            definition.signatures(),
            vec!["echo(string)".to_owned(), "echo(string,int)".to_owned()]
        );
        let one = definition.lookup("echo", &["string"]).expect("应能找到");
        assert_eq!(one.invoke(&[json!("hi")]), Ok(json!("hi")));
        assert!(definition.lookup("echo", &["int"]).is_none());
    }

    #[test]
    fn mask_replaces_stack_with_placeholder() {
        let mut fault = ServiceFault::new("Boom", "bad").with_stack(["a.rs:1", "b.rs:2"]);
        fault.mask_stack();
        assert_eq!(fault.stack, vec![MASKED_FRAME.to_owned()]);
    }
}
