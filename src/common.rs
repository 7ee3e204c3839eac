//! 全局基础类型与错误定义

use std::str::FromStr;

use arrow::error::ArrowError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;

// ── 类型别名 ──────────────────────────────────────────────────────────────────

/// 维度坐标（SOMA 的 soma_dim_N / soma_joinid 均为 int64）
pub type Coord    = i64;
/// 稠密位置（0..n-1）
pub type Position = i64;

// ── TimestampRange ────────────────────────────────────────────────────────────

/// 打开数组时的时间点快照，[start, end] 闭区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampRange {
    pub start: u64,
    pub end:   u64,
}

impl TimestampRange {
    pub fn new(start: u64, end: u64) -> Self { Self { start, end } }
    /// 只看 `end` 及之前的写入
    pub fn up_to(end: u64) -> Self { Self::new(0, end) }
    pub fn contains(&self, ts: u64) -> bool { self.start <= ts && ts <= self.end }
}

impl std::fmt::Display for TimestampRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

// ── 枚举 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode { Read, Write }

/// 结果顺序：由引擎在执行时决定，游标自身从不重排
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultOrder {
    /// 引擎自然布局
    #[default]
    Automatic,
    RowMajor,
    ColumnMajor,
}

impl FromStr for ResultOrder {
    type Err = SomaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "automatic"                      => Ok(Self::Automatic),
            "row-major" | "rowmajor" | "row_major"    => Ok(Self::RowMajor),
            "column-major" | "colmajor" | "col-major" => Ok(Self::ColumnMajor),
            other => Err(SomaError::InvalidResultOrder(other.into())),
        }
    }
}

impl std::fmt::Display for ResultOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Automatic   => "auto",
            Self::RowMajor    => "row-major",
            Self::ColumnMajor => "column-major",
        };
        f.write_str(s)
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SomaError {
    // 配置类错误：同步返回，不重试
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("column is not a dimension: {0}")]
    NotADimension(String),
    #[error("invalid range on dimension {dim}: [{lo},{hi}]")]
    InvalidRange { dim: String, lo: Coord, hi: Coord },
    #[error("invalid thread count: {0}")]
    InvalidThreadCount(usize),
    #[error("invalid partition: index={index} count={count}")]
    InvalidPartition { index: usize, count: usize },
    #[error("invalid batch size: {0}")]
    InvalidBatchSize(String),
    #[error("invalid result order: {0}")]
    InvalidResultOrder(String),
    #[error("invalid config value: {key}={value}")]
    InvalidConfig { key: String, value: String },
    #[error("cursor not configured: uri={0}")]
    NotConfigured(String),
    #[error("{op} not allowed in state {state}: uri={uri}")]
    InvalidState { op: &'static str, state: &'static str, uri: String },
    #[error("cursor closed: uri={0}")]
    Closed(String),
    #[error("{op} requires {expected:?} mode: uri={uri}")]
    WrongMode { op: &'static str, expected: OpenMode, uri: String },
    #[error("index already built")]
    IndexAlreadyBuilt,
    #[error("index not built")]
    IndexNotBuilt,
    #[error("duplicate key {key} at offsets {first} and {second}")]
    DuplicateKey { key: i64, first: usize, second: usize },
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("array not found: {0}")]
    ArrayNotFound(String),
    #[error("array already exists: {0}")]
    ArrayExists(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("unsupported: {0}")]
    Unsupported(String),

    // 资源类错误：正常情况下在本地扩容重试，只有无法推进时才上抛
    #[error("buffer for column {column} still too small after {attempts} regrowths")]
    BufferTooSmall { column: String, attempts: usize },

    // 引擎错误：附带操作与 URI 上下文
    #[error("engine error during {op} on {uri}: {source}")]
    Engine {
        op:     &'static str,
        uri:    String,
        #[source]
        source: EngineError,
    },

    #[error("cannot start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("arrow export error: {0}")]
    Arrow(#[from] ArrowError),
}

impl SomaError {
    pub fn engine(op: &'static str, uri: &str, source: EngineError) -> Self {
        Self::Engine { op, uri: uri.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, SomaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_order_parses_soma_spellings() {
        assert_eq!("auto".parse::<ResultOrder>().unwrap(), ResultOrder::Automatic);
        assert_eq!("row-major".parse::<ResultOrder>().unwrap(), ResultOrder::RowMajor);
        assert_eq!("colmajor".parse::<ResultOrder>().unwrap(), ResultOrder::ColumnMajor);
        assert!("diagonal".parse::<ResultOrder>().is_err());
    }

    #[test]
    fn engine_error_keeps_context() {
        let err = SomaError::engine("submit", "mem://x", EngineError::new("boom"));
        let msg = err.to_string();
        assert!(msg.contains("submit"));
        assert!(msg.contains("mem://x"));
        assert!(msg.contains("boom"));
    }
}
