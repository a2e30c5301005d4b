use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// 线上序列化类型码。
///
/// 码值写入每个请求帧，服务端据此挑选解码器；已发布的码值不可复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerializeType(u8);

impl SerializeType {
    pub const HESSIAN2: SerializeType = SerializeType(1);
    pub const JAVA: SerializeType = SerializeType(2);
    pub const PROTOBUF: SerializeType = SerializeType(11);
    pub const JSON: SerializeType = SerializeType(12);
    pub const MSGPACK: SerializeType = SerializeType(13);

    /// 从线上码值还原，未知码值返回 `None`。
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 | 2 | 11 | 12 | 13 => Some(SerializeType(code)),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self.0
    }

    /// 码值对应的规范名称。
    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "hessian2",
            2 => "java",
            11 => "protobuf",
            12 => "json",
            13 => "msgpack",
            _ => "unknown",
        }
    }
}

impl fmt::Display for SerializeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// 将配置中的序列化名称映射为线上码值。
///
/// # 契约说明（What）
/// - 映射是全函数且显式的：`hessian`/`hessian2` → 1，`java` → 2，`protobuf` → 11，
///   `json` → 12，`msgpack` → 13；
/// - 名称大小写不敏感，首尾空白会被忽略；
/// - 其余名称一律返回 [`RpcErrorKind::Configuration`](crate::RpcErrorKind::Configuration)，不存在默认回退，
///   使错误配置在引用构建阶段暴露，而不是在第一次调用时。
pub fn parse_serialize_type(name: &str) -> Result<SerializeType> {
    let normalized = name.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "hessian" | "hessian2" => Ok(SerializeType::HESSIAN2),
        "java" => Ok(SerializeType::JAVA),
        "protobuf" => Ok(SerializeType::PROTOBUF),
        "json" => Ok(SerializeType::JSON),
        "msgpack" => Ok(SerializeType::MSGPACK),
        _ => Err(RpcError::configuration(format!(
            "unsupported serialization `{name}`"
        ))),
    }
}
