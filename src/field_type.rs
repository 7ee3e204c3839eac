//! 列的物理类型与运行时值

use serde::{Deserialize, Serialize};

/// 时间戳精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit { Second, Millisecond, Microsecond, Nanosecond }

/// 列在结果缓冲区中的存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int8, Int16, Int32, Int64,
    UInt8, UInt16, UInt32, UInt64,
    Float32, Float64,
    /// 每行 1 字节（0/1），导出时再打包为位图
    Bool,
    /// 变长 UTF-8 字符串
    Utf8,
    /// 变长字节
    Binary,
    /// i64 时间戳
    Timestamp(TimeUnit),
    /// 枚举（分类）列：i32 编码，取值表存放在 ColumnSchema 中
    Categorical,
}

impl ColumnType {
    /// 固定字节宽度；变长类型返回 None
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Int8  | Self::UInt8 | Self::Bool                  => Some(1),
            Self::Int16 | Self::UInt16                              => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32
                | Self::Categorical                                 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64
                | Self::Timestamp(_)                                => Some(8),
            Self::Utf8  | Self::Binary                              => None,
        }
    }

    pub fn is_var(self) -> bool { self.fixed_size().is_none() }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64
                | Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64
        )
    }

    /// 类型名，供绑定层的 get_column_types 使用
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Int8         => "int8",
            Self::Int16        => "int16",
            Self::Int32        => "int32",
            Self::Int64        => "int64",
            Self::UInt8        => "uint8",
            Self::UInt16       => "uint16",
            Self::UInt32       => "uint32",
            Self::UInt64       => "uint64",
            Self::Float32      => "float32",
            Self::Float64      => "float64",
            Self::Bool         => "bool",
            Self::Utf8         => "string",
            Self::Binary       => "binary",
            Self::Timestamp(u) => match u {
                TimeUnit::Second      => "timestamp[s]",
                TimeUnit::Millisecond => "timestamp[ms]",
                TimeUnit::Microsecond => "timestamp[us]",
                TimeUnit::Nanosecond  => "timestamp[ns]",
            },
            Self::Categorical  => "dictionary<int32,string>",
        }
    }
}

/// 单元格值（运行时表示）
///
/// 时间戳以 `Int64` 表示，分类列以 `Int32` 编码表示。
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Utf8(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)   => Some(*v as i64),
            Self::Int16(v)  => Some(*v as i64),
            Self::Int32(v)  => Some(*v as i64),
            Self::Int64(v)  => Some(*v),
            Self::UInt8(v)  => Some(*v as i64),
            Self::UInt16(v) => Some(*v as i64),
            Self::UInt32(v) => Some(*v as i64),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            other            => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Utf8(s)  => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// 值能否存入该类型的列（Null 总是可以，是否允许由列的 nullable 决定）
    pub fn fits(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (Self::Null, _)                                     => true,
            (Self::Int8(_),    ColumnType::Int8)                => true,
            (Self::Int16(_),   ColumnType::Int16)               => true,
            (Self::Int32(_),   ColumnType::Int32)               => true,
            (Self::Int32(_),   ColumnType::Categorical)         => true,
            (Self::Int64(_),   ColumnType::Int64)               => true,
            (Self::Int64(_),   ColumnType::Timestamp(_))        => true,
            (Self::UInt8(_),   ColumnType::UInt8)               => true,
            (Self::UInt16(_),  ColumnType::UInt16)              => true,
            (Self::UInt32(_),  ColumnType::UInt32)              => true,
            (Self::UInt64(_),  ColumnType::UInt64)              => true,
            (Self::Float32(_), ColumnType::Float32)             => true,
            (Self::Float64(_), ColumnType::Float64)             => true,
            (Self::Bool(_),    ColumnType::Bool)                => true,
            (Self::Utf8(_),    ColumnType::Utf8)                => true,
            (Self::Bytes(_),   ColumnType::Binary)              => true,
            _ => false,
        }
    }
}

impl From<i64>  for Value { fn from(v: i64)  -> Self { Self::Int64(v) } }
impl From<i32>  for Value { fn from(v: i32)  -> Self { Self::Int32(v) } }
impl From<u64>  for Value { fn from(v: u64)  -> Self { Self::UInt64(v) } }
impl From<f32>  for Value { fn from(v: f32)  -> Self { Self::Float32(v) } }
impl From<f64>  for Value { fn from(v: f64)  -> Self { Self::Float64(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Self::Bool(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Self::Utf8(v.into()) } }

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::UInt8(v)   => write!(f, "{v}"),
            Self::UInt16(v)  => write!(f, "{v}"),
            Self::UInt32(v)  => write!(f, "{v}"),
            Self::UInt64(v)  => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bool(v)    => write!(f, "{v}"),
            Self::Utf8(s)    => write!(f, "{s}"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}
