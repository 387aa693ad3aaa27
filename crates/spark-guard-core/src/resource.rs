//! # resource 模块说明
//!
//! ## 角色定位（Why）
//! - [`ResourceWrapper`] 是被保护资源的不可变身份，既是槽位链缓存的键，也是统计节点的键；
//! - [`ParamValue`] 承载调用参数，用于热点参数限流与集群参数令牌请求。
//!
//! ## 契约（What）
//! - 资源身份由 `(name, entry_type)` 决定；`resource_type` 仅为分类标签，不参与相等比较；
//! - `ParamValue` 可哈希、可比较，允许作为按值计数的键。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 调用方向：入站（被调用）或出站（调用外部）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// 入站流量，参与系统自适应保护统计。
    In,
    /// 出站流量。
    #[default]
    Out,
}

/// 资源分类标签。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Common,
    Web,
    Rpc,
    ApiGateway,
    DbSql,
}

/// 被保护资源的身份。
///
/// # 教案式注释
/// - **意图 (Why)**：统一描述“哪个资源、哪个方向”，作为全局缓存与统计的索引；
/// - **契约 (What)**：创建后不可变，克隆仅增加 `Arc<str>` 引用计数；
/// - **风险 (Trade-offs)**：资源名应为低基数字符串，否则会迅速触达槽位链缓存上限。
#[derive(Clone, Debug)]
pub struct ResourceWrapper {
    name: Arc<str>,
    entry_type: EntryType,
    resource_type: ResourceType,
}

impl ResourceWrapper {
    pub fn new(name: impl Into<Arc<str>>, entry_type: EntryType) -> Self {
        Self {
            name: name.into(),
            entry_type,
            resource_type: ResourceType::Common,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }
}

impl PartialEq for ResourceWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.entry_type == other.entry_type && self.name == other.name
    }
}

impl Eq for ResourceWrapper {}

impl Hash for ResourceWrapper {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.entry_type.hash(state);
    }
}

impl fmt::Display for ResourceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// 调用参数值。
///
/// 反序列化时按 `Int → Bool → Str` 的顺序尝试，因此规则文件中的 `item_thresholds`
/// 可以直接书写数字、布尔或字符串。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}
