//! # soma-query
//!
//! 稀疏数组查询层：在外部列存引擎之上提供分批流式读取，以及并行的
//! int64 键重建索引。
//!
//! ## 整体架构
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      QueryCursor                         │
//! │   options ─ columns / batch_size / order / timestamp     │
//! │   Selection ─ dim → points ∪ ranges                      │
//! │       │                                                  │
//! │       │ configure → next ⇄ (regrow) → Exhausted → close  │
//! │       ▼                                                  │
//! │   ┌──────────────┐   submit   ┌──────────────────────┐   │
//! │   │  BufferSet   │ ◄───────── │  dyn ArrayHandle     │   │
//! │   │  data/offsets│            │  (StorageEngine)     │   │
//! │   │  /validity   │            │   └─ MemEngine       │   │
//! │   └──────┬───────┘            └──────────────────────┘   │
//! │          │ to_record_batch / export_ffi                  │
//! │          ▼                                               │
//! │     Arrow RecordBatch / C Data Interface                 │
//! └─────────────────────────────────────────────────────────┘
//!
//! IntIndexer:  keys ──build(T)──► KeyIndex (分片 FxHashMap)
//!              keys ──resolve(T)──► 位置 | -1
//! ```

pub mod common;
pub mod config;
pub mod field_type;
pub mod schema;

pub mod buffers;
pub mod selection;
pub mod engine;
pub mod cursor;
pub mod arrow_export;

pub mod reindexer;

pub use common::{Result, SomaError};
pub use cursor::{CursorOptions, CursorState, QueryCursor};
pub use reindexer::{IntIndexer, NOT_FOUND};
