//! 平台配置与批大小策略
//!
//! 绑定层以字符串键值对传入配置（对应 platform_config），
//! 这里解析为强类型字段；未知键原样保留。

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::buffers::BufferBudget;
use crate::common::{Result, SomaError};

pub const KEY_INIT_BUFFER_BYTES:   &str = "soma.init_buffer_bytes";
pub const KEY_CONCURRENCY_LEVEL:   &str = "sm.compute_concurrency_level";
pub const KEY_MAX_REGROW_ATTEMPTS: &str = "soma.max_regrow_attempts";

/// 每列初始缓冲区字节数
pub const DEFAULT_INIT_BUFFER_BYTES:   usize = 16 << 20;
pub const DEFAULT_MAX_REGROW_ATTEMPTS: usize = 8;

// ── PlatformConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub init_buffer_bytes:         usize,
    pub compute_concurrency_level: usize,
    pub max_regrow_attempts:       usize,
    /// 本层不认识的键（交给引擎）
    #[serde(default)]
    pub extra:                     BTreeMap<String, String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            init_buffer_bytes:         DEFAULT_INIT_BUFFER_BYTES,
            compute_concurrency_level: cores,
            max_regrow_attempts:       DEFAULT_MAX_REGROW_ATTEMPTS,
            extra:                     BTreeMap::new(),
        }
    }
}

impl PlatformConfig {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();
        for (k, v) in map {
            match k.as_str() {
                KEY_INIT_BUFFER_BYTES   => cfg.init_buffer_bytes = parse_positive(k, v)?,
                KEY_CONCURRENCY_LEVEL   => cfg.compute_concurrency_level = parse_positive(k, v)?,
                KEY_MAX_REGROW_ATTEMPTS => cfg.max_regrow_attempts = parse_positive(k, v)?,
                _ => { cfg.extra.insert(k.clone(), v.clone()); }
            }
        }
        Ok(cfg)
    }

    pub fn with_init_buffer_bytes(mut self, bytes: usize) -> Self {
        self.init_buffer_bytes = bytes; self
    }

    /// 重建索引默认线程数：并发度的一半，至少 1
    pub fn reindexer_threads(&self) -> usize {
        (self.compute_concurrency_level / 2).max(1)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SomaError::InvalidConfig { key: key.into(), value: value.into() }),
    }
}

// ── BatchSize ─────────────────────────────────────────────────────────────────

/// 每批结果的大小策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchSize {
    /// 由配置（init_buffer_bytes）推导
    #[default]
    Auto,
    /// 每批目标行数
    Rows(usize),
    /// 每列目标字节数
    Bytes(usize),
}

impl BatchSize {
    pub fn budget(self, cfg: &PlatformConfig) -> BufferBudget {
        match self {
            Self::Auto     => BufferBudget::Bytes(cfg.init_buffer_bytes),
            Self::Rows(n)  => BufferBudget::Rows(n),
            Self::Bytes(b) => BufferBudget::Bytes(b),
        }
    }
}

impl FromStr for BatchSize {
    type Err = SomaError;

    /// 接受 `auto`、`rows=N`、`bytes=N` 或单独的行数 `N`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || SomaError::InvalidBatchSize(s.into());
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let (kind, num) = s.split_once('=').unwrap_or(("rows", s));
        let n: usize = num.trim().parse().map_err(|_| bad())?;
        if n == 0 {
            return Err(bad());
        }
        match kind.trim() {
            "rows"  => Ok(Self::Rows(n)),
            "bytes" => Ok(Self::Bytes(n)),
            _       => Err(bad()),
        }
    }
}
