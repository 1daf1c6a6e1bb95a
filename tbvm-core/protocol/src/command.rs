//! QGA 命令构建器
//!
//! 一个命令是不可变、可复用的值：名称、逐步累积的参数，以及把 `return` 字段
//! 转换为类型化结果的纯函数。构建阶段发现的必需参数缺失直接返回错误，
//! 不会产生任何通道调用。

use std::fmt;

use serde_json::{Map, Value};
use tbvm_transport::GuestChannel;
use tracing::{debug, trace};

use crate::protocol::{QgaCommand, QgaResponse};
use crate::{AgentError, Result};

/// 响应提取函数：`return` 字段 -> 类型化结果
pub type Extractor<T> = fn(Value) -> Result<T>;

/// 类型化的 Guest Agent 命令
pub struct GuestCommand<T> {
    name: &'static str,
    arguments: Map<String, Value>,
    arguments_required: bool,
    extract: Extractor<T>,
}

impl<T> GuestCommand<T> {
    pub fn new(name: &'static str, extract: Extractor<T>) -> Self {
        Self {
            name,
            arguments: Map::new(),
            arguments_required: true,
            extract,
        }
    }

    /// 之后添加的参数都允许省略
    pub fn arguments_now_optional(mut self) -> Self {
        self.arguments_required = false;
        self
    }

    fn omitted(&self, property: &str) -> Result<()> {
        if self.arguments_required {
            return Err(AgentError::MissingProperty {
                command: self.name,
                property: property.to_string(),
            });
        }
        Ok(())
    }

    /// 添加标量参数
    pub fn property<V: Into<Value>>(mut self, property: &str, value: Option<V>) -> Result<Self> {
        match value {
            Some(value) => {
                self.arguments.insert(property.to_string(), value.into());
            }
            None => self.omitted(property)?,
        }
        Ok(self)
    }

    /// 只有与默认值不同时才序列化布尔参数
    pub fn property_if_not_default(mut self, property: &str, value: bool, default: bool) -> Self {
        if value != default {
            self.arguments.insert(property.to_string(), Value::Bool(value));
        }
        self
    }

    /// 添加数组参数；空数组整体省略（部分 Agent 实现拒绝 `[]`）
    pub fn array<S: AsRef<str>>(mut self, property: &str, elements: Option<&[S]>) -> Result<Self> {
        match elements {
            Some(elements) => {
                if !elements.is_empty() {
                    let array = elements
                        .iter()
                        .map(|e| Value::String(e.as_ref().to_string()))
                        .collect();
                    self.arguments.insert(property.to_string(), Value::Array(array));
                }
            }
            None => self.omitted(property)?,
        }
        Ok(self)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// 序列化为 `{"execute": ..., "arguments": {...}}`
    pub fn request(&self) -> Result<String> {
        let command = QgaCommand {
            execute: self.name,
            arguments: &self.arguments,
        };
        serde_json::to_string(&command)
            .map_err(|e| AgentError::Protocol(format!("序列化 {} 失败: {}", self.name, e)))
    }

    /// 解析响应文本并应用提取函数
    pub fn extract(&self, response: &str) -> Result<T> {
        let response: QgaResponse = serde_json::from_str(response)
            .map_err(|e| AgentError::Protocol(format!("{}: 无法解析响应: {}", self.name, e)))?;

        if let Some(error) = response.error {
            return Err(AgentError::CommandFailed {
                class: error.error_class,
                desc: error.desc,
            });
        }

        let ret = response
            .ret
            .ok_or_else(|| AgentError::Protocol(format!("{}: 响应缺少 return 字段", self.name)))?;

        (self.extract)(ret)
    }

    /// 通过通道发送命令并返回类型化结果
    pub fn run<C: GuestChannel + ?Sized>(&self, channel: &C, log: bool) -> Result<T> {
        let request = self.request()?;

        if log {
            debug!(execute = self.name, %request, "发送 Guest Agent 命令");
        } else {
            trace!(execute = self.name, "发送 Guest Agent 命令");
        }

        let response = channel.agent_command(&request)?;

        if log {
            debug!(execute = self.name, %response, "收到 Guest Agent 响应");
        }

        self.extract(&response)
    }
}

impl<T> Clone for GuestCommand<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            arguments: self.arguments.clone(),
            arguments_required: self.arguments_required,
            extract: self.extract,
        }
    }
}

impl<T> fmt::Debug for GuestCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCommand")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("arguments_required", &self.arguments_required)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(_: Value) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_required_property_missing_fails_at_build() {
        let result = GuestCommand::new("guest-exec", unit).property::<String>("path", None);
        match result {
            Err(AgentError::MissingProperty { command, property }) => {
                assert_eq!(command, "guest-exec");
                assert_eq!(property, "path");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_optional_property_can_be_omitted() {
        let cmd = GuestCommand::new("guest-file-open", unit)
            .property("path", Some("/root/a"))
            .unwrap()
            .arguments_now_optional()
            .property::<String>("mode", None)
            .unwrap();

        assert_eq!(cmd.arguments().len(), 1);
        assert_eq!(cmd.arguments()["path"], json!("/root/a"));
    }

    #[test]
    fn test_empty_array_is_omitted() {
        let empty: Vec<String> = Vec::new();
        let cmd = GuestCommand::new("guest-exec", unit)
            .array("arg", Some(empty.as_slice()))
            .unwrap();

        assert!(!cmd.arguments().contains_key("arg"));
        assert!(!cmd.request().unwrap().contains("\"arg\""));
    }

    #[test]
    fn test_required_array_missing_fails() {
        let result = GuestCommand::new("guest-exec", unit).array::<String>("arg", None);
        assert!(matches!(result, Err(AgentError::MissingProperty { .. })));
    }

    #[test]
    fn test_boolean_only_serialized_when_not_default() {
        let cmd = GuestCommand::new("guest-exec", unit)
            .property_if_not_default("capture-output", false, false);
        assert!(cmd.arguments().is_empty());

        let cmd = cmd.property_if_not_default("capture-output", true, false);
        assert_eq!(cmd.arguments()["capture-output"], json!(true));
    }

    #[test]
    fn test_request_shape() {
        let cmd = GuestCommand::new("guest-exec-status", unit)
            .property("pid", Some(42))
            .unwrap();
        let request: Value = serde_json::from_str(&cmd.request().unwrap()).unwrap();
        assert_eq!(request, json!({ "execute": "guest-exec-status", "arguments": { "pid": 42 } }));
    }

    #[test]
    fn test_request_without_arguments_has_empty_object() {
        let cmd = GuestCommand::new("guest-ping", unit);
        let request: Value = serde_json::from_str(&cmd.request().unwrap()).unwrap();
        assert_eq!(request["arguments"], json!({}));
    }

    #[test]
    fn test_extract_missing_return_is_protocol_error() {
        let cmd = GuestCommand::new("guest-ping", unit);
        assert!(matches!(cmd.extract("{}"), Err(AgentError::Protocol(_))));
    }

    #[test]
    fn test_extract_agent_error_object() {
        let cmd = GuestCommand::new("guest-ping", unit);
        let err = cmd
            .extract(r#"{"error":{"class":"GenericError","desc":"boom"}}"#)
            .unwrap_err();
        match err {
            AgentError::CommandFailed { class, desc } => {
                assert_eq!(class, "GenericError");
                assert_eq!(desc, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
