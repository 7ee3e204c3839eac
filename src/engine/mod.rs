//! 存储引擎协作接口
//!
//! 游标只通过这里的两个 trait 调用引擎，从不解释磁盘布局：
//!
//! ```text
//! StorageEngine::open(uri, mode, timestamp) ──► Box<dyn ArrayHandle>
//!     configure_selection(dim, points ∪ ranges)
//!     set_layout(order)
//!     submit(&mut BufferSet) ──► Complete | Incomplete
//!     result_buffer_elements(column)
//!     reset() / close()
//! ```
//!
//! `memory` 提供一个内存实现，供测试、演示以及没有真实引擎的绑定层使用。

pub mod memory;

use thiserror::Error;

use crate::buffers::BufferSet;
use crate::common::{OpenMode, ResultOrder, TimestampRange};
use crate::schema::ArraySchema;
use crate::selection::DimSelection;

pub use memory::MemEngine;

/// 引擎返回的错误，游标会附加操作名与 URI 后再上抛
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    pub code:    Option<i32>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None }
    }
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code); self
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// 一次 submit 之后的查询状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// 选择已全部读完
    Complete,
    /// 缓冲区已满，还有结果；再次 submit 从引擎记录的位置继续
    Incomplete,
}

/// 某列在最近一次 submit 中写入的元素数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultElements {
    pub rows:       usize,
    pub data_bytes: usize,
    /// 有效位元素数；非可空列为 0
    pub validity:   usize,
}

impl ResultElements {
    pub fn of(buffers: &BufferSet, column: &str) -> Option<Self> {
        buffers.column(column).map(|c| Self {
            rows:       c.rows(),
            data_bytes: c.data().len(),
            validity:   c.validity().map_or(0, <[u8]>::len),
        })
    }
}

pub trait StorageEngine: Send + Sync {
    fn schema(&self, uri: &str) -> EngineResult<ArraySchema>;

    fn open(
        &self,
        uri:       &str,
        mode:      OpenMode,
        timestamp: Option<TimestampRange>,
    ) -> EngineResult<Box<dyn ArrayHandle>>;
}

/// 已打开的数组句柄，同时承载一个可续读的查询
pub trait ArrayHandle: Send {
    fn uri(&self) -> &str;
    fn mode(&self) -> OpenMode;
    fn schema(&self) -> &ArraySchema;

    fn configure_selection(&mut self, dim: &str, selection: &DimSelection) -> EngineResult<()>;
    fn clear_selection(&mut self);
    fn set_layout(&mut self, order: ResultOrder) -> EngineResult<()>;

    /// 从上次停下的位置继续填充 `buffers`
    fn submit(&mut self, buffers: &mut BufferSet) -> EngineResult<QueryStatus>;
    fn result_buffer_elements(&self, column: &str) -> Option<ResultElements>;

    /// 丢弃引擎侧进度，保留数组打开状态
    fn reset(&mut self);

    fn write(&mut self, buffers: &BufferSet) -> EngineResult<()>;

    /// 非空单元格数
    fn nnz(&self) -> EngineResult<u64>;
    /// 每个维度的容量
    fn shape(&self) -> EngineResult<Vec<i64>>;

    fn close(&mut self);
}
