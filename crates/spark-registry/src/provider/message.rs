//! 本地调用的请求、响应与异常模型。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::method::ServiceFault;

/// 一次本地调用请求。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: u64,
    pub interface: String,
    pub method: String,
    /// 参数类型签名，与方法表注册时的类型名逐项比较。
    #[serde(default)]
    pub param_types: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

impl Request {
    pub fn new(request_id: u64, interface: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            request_id,
            interface: interface.into(),
            method: method.into(),
            param_types: Vec::new(),
            arguments: Vec::new(),
            attachments: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_signature<S: AsRef<str>>(mut self, param_types: &[S]) -> Self {
        self.param_types = param_types.iter().map(|t| t.as_ref().to_owned()).collect();
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// `method(t1,t2)` 形式的方法签名。
    pub fn method_signature(&self) -> String {
        format!("{}({})", self.method, self.param_types.join(","))
    }
}

/// 响应中携带的框架异常。
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcException {
    /// 方法表中不存在请求的签名。
    #[error("service method not exist: {interface}.{signature}")]
    ServiceNotFound { interface: String, signature: String },
    /// 业务方法返回了失败。
    #[error("provider call process error: {cause}")]
    Business { cause: ServiceFault },
    /// 业务方法发生了致命错误（panic）。
    #[error("provider has encountered a fatal error: {message}")]
    Fatal { message: String, stack: Vec<String> },
}

impl RpcException {
    pub fn code(&self) -> &'static str {
        match self {
            RpcException::ServiceNotFound { .. } => "registry.invoke.not_found",
            RpcException::Business { .. } => "registry.invoke.business",
            RpcException::Fatal { .. } => "registry.invoke.fatal",
        }
    }

    /// 业务异常的原因。
    pub fn cause(&self) -> Option<&ServiceFault> {
        match self {
            RpcException::Business { cause } => Some(cause),
            _ => None,
        }
    }

    /// 异常栈（不存在时为空）。
    pub fn stack(&self) -> &[String] {
        match self {
            RpcException::Business { cause } => cause.stack.as_slice(),
            RpcException::Fatal { stack, .. } => stack.as_slice(),
            RpcException::ServiceNotFound { .. } => &[],
        }
    }

    /// 把异常栈替换为占位帧，避免向调用方泄露服务端实现细节。
    pub fn mask_stack(&mut self) {
        match self {
            RpcException::Business { cause } => cause.mask_stack(),
            RpcException::Fatal { stack, .. } => *stack = vec![super::method::MASKED_FRAME.to_owned()],
            RpcException::ServiceNotFound { .. } => {}
        }
    }
}

/// 一次本地调用的响应。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: u64,
    pub value: Option<Value>,
    pub exception: Option<RpcException>,
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

impl Response {
    pub fn success(request: &Request, value: Value) -> Self {
        Self {
            request_id: request.request_id,
            value: Some(value),
            exception: None,
            attachments: request.attachments.clone(),
        }
    }

    pub fn failure(request: &Request, exception: RpcException) -> Self {
        Self {
            request_id: request.request_id,
            value: None,
            exception: Some(exception),
            attachments: request.attachments.clone(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.exception.is_none()
    }
}
