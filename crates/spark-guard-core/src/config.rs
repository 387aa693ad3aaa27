//! # config 模块说明
//!
//! ## 意图（Why）
//! - 将准入引擎的容量上限与统计窗口参数外部化，允许以 TOML 文件或手工构造的结构体初始化；
//! - 进程级配置只安装一次，此后所有统计节点与上下文表读取同一份快照。
//!
//! ## 契约（What）
//! - 未出现在 TOML 中的字段取默认值：槽位链上限 6000、上下文名上限 2000、
//!   秒级窗口 2 个样本 / 1000 ms；
//! - [`EngineConfig::validate`] 保证 `interval_ms` 能被 `sample_count` 整除。

use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MAX_SLOT_CHAIN_SIZE: usize = 6000;
pub const DEFAULT_MAX_CONTEXT_NAME_SIZE: usize = 2000;

/// 秒级滑动窗口参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticConfig {
    pub sample_count: u32,
    pub interval_ms: u32,
}

impl Default for StatisticConfig {
    fn default() -> Self {
        Self {
            sample_count: 2,
            interval_ms: 1000,
        }
    }
}

/// 准入引擎配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_slot_chain_size: usize,
    pub max_context_name_size: usize,
    pub statistic: StatisticConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_slot_chain_size: DEFAULT_MAX_SLOT_CHAIN_SIZE,
            max_context_name_size: DEFAULT_MAX_CONTEXT_NAME_SIZE,
            statistic: StatisticConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_slot_chain_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_slot_chain_size",
                detail: "must be positive".into(),
            });
        }
        if self.max_context_name_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_context_name_size",
                detail: "must be positive".into(),
            });
        }
        let stat = self.statistic;
        if stat.sample_count == 0 || stat.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "statistic",
                detail: "sample_count and interval_ms must be positive".into(),
            });
        }
        if stat.interval_ms % stat.sample_count != 0 {
            return Err(ConfigError::Invalid {
                field: "statistic.interval_ms",
                detail: format!(
                    "{} is not divisible by sample_count {}",
                    stat.interval_ms, stat.sample_count
                ),
            });
        }
        Ok(())
    }
}

static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// 安装进程级配置；重复安装返回 `false` 且保留首次配置。
pub(crate) fn install(config: EngineConfig) -> bool {
    ENGINE_CONFIG.set(config).is_ok()
}

/// 读取进程级配置，未安装时使用默认值。
pub fn engine() -> &'static EngineConfig {
    ENGINE_CONFIG.get_or_init(EngineConfig::default)
}
