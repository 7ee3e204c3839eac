//! 流式查询游标（QueryCursor）
//!
//! 对一个数组做选择 + 投影，并把结果按预算大小分批交付。
//!
//! ```text
//! Unconfigured ──configure──► Configured ──next──► Submitted ⇄ next
//!      ▲   setters                 ▲                   │ Complete
//!      └───────────────────────────┤ reset             ▼
//!                                  └─────────────── Exhausted
//! 任意状态 ──close──► Closed
//! ```
//!
//! 每次 `next` 都是一轮 submit：引擎一行都写不下时（Incomplete 且 0 行），
//! 把报告了缺口的列放大到 `max(2 × 容量, 需要)` 后重试，有次数上限。
//! 行的顺序完全由引擎决定，游标不重排。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::buffers::{BufferSet, ColumnBuffer};
use crate::common::{Coord, OpenMode, Result, ResultOrder, SomaError, TimestampRange};
use crate::config::{BatchSize, PlatformConfig};
use crate::engine::{ArrayHandle, EngineError, QueryStatus, StorageEngine};
use crate::field_type::ColumnType;
use crate::schema::{ArraySchema, ColumnSchema};
use crate::selection::{partition_points, Selection};

// ── 状态 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unconfigured,
    Configured,
    /// 至少交付过一批，引擎还有结果
    Submitted,
    /// 引擎报告 Complete，最后一批已交付
    Exhausted,
    Closed,
}

impl CursorState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured   => "configured",
            Self::Submitted    => "submitted",
            Self::Exhausted    => "exhausted",
            Self::Closed       => "closed",
        }
    }
}

// ── 选项 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CursorOptions {
    pub mode:         OpenMode,
    /// 空 = 全部列（schema 顺序）
    pub column_names: Vec<String>,
    pub batch_size:   BatchSize,
    pub result_order: ResultOrder,
    pub timestamp:    Option<TimestampRange>,
    pub config:       PlatformConfig,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            mode:         OpenMode::Read,
            column_names: vec![],
            batch_size:   BatchSize::Auto,
            result_order: ResultOrder::Automatic,
            timestamp:    None,
            config:       PlatformConfig::default(),
        }
    }
}

impl CursorOptions {
    pub fn read()  -> Self { Self::default() }
    pub fn write() -> Self { Self { mode: OpenMode::Write, ..Self::default() } }

    pub fn columns(mut self, names: &[&str]) -> Self {
        self.column_names = names.iter().map(|s| s.to_string()).collect(); self
    }
    pub fn batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size; self
    }
    pub fn result_order(mut self, order: ResultOrder) -> Self {
        self.result_order = order; self
    }
    pub fn timestamp(mut self, ts: TimestampRange) -> Self {
        self.timestamp = Some(ts); self
    }
    pub fn config(mut self, config: PlatformConfig) -> Self {
        self.config = config; self
    }
}

// ── 统计 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorStats {
    pub submissions: u64,
    pub batches:     u64,
    pub rows:        u64,
    pub regrowths:   u64,
    pub bytes_grown: u64,
}

// ── QueryCursor ───────────────────────────────────────────────────────────────

pub struct QueryCursor {
    engine:    Arc<dyn StorageEngine>,
    uri:       String,
    options:   CursorOptions,
    schema:    ArraySchema,
    selection: Selection,
    /// 投影后的列（configure 之后有效）
    columns:   Vec<ColumnSchema>,
    handle:    Option<Box<dyn ArrayHandle>>,
    buffers:   Option<BufferSet>,
    /// 当前 BufferSet 是否承载着已交付的一批
    delivered: bool,
    state:     CursorState,
    stats:     CursorStats,
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("uri", &self.uri)
            .field("state", &self.state)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish()
    }
}

impl QueryCursor {
    /// 读取数组 schema 并创建游标；数组在第一次需要时才打开
    pub fn new(engine: Arc<dyn StorageEngine>, uri: &str, options: CursorOptions) -> Result<Self> {
        let schema = engine.schema(uri).map_err(|e| SomaError::engine("schema", uri, e))?;
        Ok(Self {
            engine,
            uri:       uri.into(),
            options,
            schema,
            selection: Selection::new(),
            columns:   vec![],
            handle:    None,
            buffers:   None,
            delivered: false,
            state:     CursorState::Unconfigured,
            stats:     CursorStats::default(),
        })
    }

    pub fn uri(&self)           -> &str            { &self.uri }
    pub fn state(&self)         -> CursorState     { self.state }
    pub fn schema(&self)        -> &ArraySchema    { &self.schema }
    pub fn options(&self)       -> &CursorOptions  { &self.options }
    pub fn selection(&self)     -> &Selection      { &self.selection }
    pub fn stats(&self)         -> &CursorStats    { &self.stats }
    pub fn ndim(&self)          -> usize           { self.schema.ndim() }
    pub fn is_complete(&self)   -> bool            { self.state == CursorState::Exhausted }

    /// 最近一次交付的批次；第一次 submit 之前为 None
    pub fn buffers(&self) -> Option<&BufferSet> {
        if self.delivered { self.buffers.as_ref() } else { None }
    }

    // ── 设置 ──────────────────────────────────────────────────────────────

    fn check_setup(&self, op: &'static str) -> Result<()> {
        match self.state {
            CursorState::Unconfigured | CursorState::Configured => Ok(()),
            CursorState::Closed => Err(SomaError::Closed(self.uri.clone())),
            s => Err(SomaError::InvalidState { op, state: s.name(), uri: self.uri.clone() }),
        }
    }

    /// 已配置的游标在设置变化后重新配置
    fn refresh(&mut self) -> Result<()> {
        if self.state == CursorState::Configured {
            self.configure()?;
        }
        Ok(())
    }

    pub fn select_columns(&mut self, names: &[&str]) -> Result<()> {
        self.check_setup("select_columns")?;
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        self.schema.project(&names)?;
        self.options.column_names = names;
        self.refresh()
    }

    /// 替换该维度的点选择
    pub fn set_dim_points(&mut self, dim: &str, points: &[Coord]) -> Result<()> {
        self.check_setup("set_dim_points")?;
        self.schema.selectable_dim(dim)?;
        self.selection.set_points(dim, points);
        self.refresh()
    }

    /// 只选择点列表的第 `partition_index` / `partition_count` 段
    pub fn set_dim_points_partitioned(
        &mut self,
        dim:             &str,
        points:          &[Coord],
        partition_index: usize,
        partition_count: usize,
    ) -> Result<()> {
        let part = partition_points(points, partition_index, partition_count)?;
        self.set_dim_points(dim, part)
    }

    /// 替换该维度的区间选择
    pub fn set_dim_ranges(&mut self, dim: &str, ranges: &[(Coord, Coord)]) -> Result<()> {
        self.check_setup("set_dim_ranges")?;
        self.schema.selectable_dim(dim)?;
        self.selection.set_ranges(dim, ranges)?;
        self.refresh()
    }

    pub fn set_result_order(&mut self, order: ResultOrder) -> Result<()> {
        self.check_setup("set_result_order")?;
        self.options.result_order = order;
        self.refresh()
    }

    pub fn set_batch_size(&mut self, batch_size: BatchSize) -> Result<()> {
        self.check_setup("set_batch_size")?;
        self.options.batch_size = batch_size;
        self.refresh()
    }

    /// 校验设置并分配缓冲区
    pub fn configure(&mut self) -> Result<()> {
        self.check_setup("configure")?;
        if matches!(self.options.batch_size, BatchSize::Rows(0) | BatchSize::Bytes(0)) {
            return Err(SomaError::InvalidBatchSize(format!("{:?}", self.options.batch_size)));
        }
        let columns = self.schema.project(&self.options.column_names)?;
        self.selection.validate(&self.schema)?;

        if self.options.mode == OpenMode::Read {
            let budget = self.options.batch_size.budget(&self.options.config);
            self.buffers = Some(BufferSet::allocate(&columns, budget));
            debug!(
                uri = %self.uri, columns = columns.len(), ?budget,
                order = %self.options.result_order, "cursor configured"
            );
        }
        self.columns   = columns;
        self.delivered = false;
        self.state     = CursorState::Configured;
        Ok(())
    }

    // ── 读取 ──────────────────────────────────────────────────────────────

    fn open_handle(&mut self) -> Result<()> {
        if self.handle.is_none() {
            let handle = self.engine
                .open(&self.uri, self.options.mode, self.options.timestamp)
                .map_err(|e| SomaError::engine("open", &self.uri, e))?;
            debug!(uri = %self.uri, mode = ?self.options.mode, "array opened");
            self.handle = Some(handle);
        }
        Ok(())
    }

    /// 把选择与布局下发给引擎
    fn start_query(&mut self) -> Result<()> {
        self.open_handle()?;
        let Some(handle) = self.handle.as_mut() else {
            return Err(SomaError::NotConfigured(self.uri.clone()));
        };
        handle.clear_selection();
        for (dim, sel) in self.selection.iter().filter(|(_, s)| !s.is_empty()) {
            handle.configure_selection(dim, sel)
                .map_err(|e| SomaError::engine("configure_selection", &self.uri, e))?;
        }
        handle.set_layout(self.options.result_order)
            .map_err(|e| SomaError::engine("set_layout", &self.uri, e))?;
        Ok(())
    }

    /// 取下一批；全部读完后返回 `Ok(None)`
    pub fn next(&mut self) -> Result<Option<&BufferSet>> {
        match self.state {
            CursorState::Closed       => return Err(SomaError::Closed(self.uri.clone())),
            CursorState::Unconfigured => return Err(SomaError::NotConfigured(self.uri.clone())),
            CursorState::Exhausted    => return Ok(None),
            CursorState::Configured | CursorState::Submitted => {}
        }
        if self.options.mode != OpenMode::Read {
            return Err(SomaError::WrongMode { op: "next", expected: OpenMode::Read, uri: self.uri.clone() });
        }
        if self.state == CursorState::Configured {
            self.start_query()?;
        }

        let max_attempts = self.options.config.max_regrow_attempts;
        let first_batch  = self.awaiting_first_batch();
        let (Some(handle), Some(buffers)) = (self.handle.as_mut(), self.buffers.as_mut()) else {
            return Err(SomaError::NotConfigured(self.uri.clone()));
        };

        let mut attempts = 0;
        let (status, rows) = loop {
            buffers.clear();
            let status = handle.submit(buffers)
                .map_err(|e| SomaError::engine("submit", &self.uri, e))?;
            self.stats.submissions += 1;
            let rows = result_rows(&**handle, buffers, &self.uri)?;
            trace!(uri = %self.uri, ?status, rows, "submitted");

            if status == QueryStatus::Complete || rows > 0 {
                break (status, rows);
            }
            // Incomplete 且一行都没写：放大缺口列后重试
            let short = buffers.shortfalls();
            if short.is_empty() || attempts >= max_attempts {
                let column = short.first().map_or_else(|| buffers.column_names().join(","), |s| s.0.clone());
                return Err(SomaError::BufferTooSmall { column, attempts });
            }
            attempts += 1;
            for (name, needed) in short {
                let cap      = buffers.column(&name).map_or(0, ColumnBuffer::data_capacity);
                let new_size = needed.max(cap * 2);
                warn!(uri = %self.uri, column = %name, from = cap, to = new_size, attempt = attempts, "regrowing result buffer");
                buffers.grow(&name, new_size)?;
                self.stats.regrowths   += 1;
                self.stats.bytes_grown += (new_size - cap) as u64;
            }
        };

        self.state = match status {
            QueryStatus::Complete   => CursorState::Exhausted,
            QueryStatus::Incomplete => CursorState::Submitted,
        };
        // 空的首批照常交付一次，空的尾批不交付
        if rows == 0 && !first_batch {
            self.delivered = false;
            debug!(uri = %self.uri, "query complete");
            return Ok(None);
        }
        self.stats.batches += 1;
        self.stats.rows    += rows as u64;
        self.delivered      = true;
        debug!(uri = %self.uri, rows, complete = self.is_complete(), "batch ready");
        Ok(self.buffers.as_ref())
    }

    /// 自上次 configure / reset 以来还没交付过批次
    fn awaiting_first_batch(&self) -> bool {
        self.state == CursorState::Configured
    }

    /// 丢弃进度，保留配置与打开的数组
    pub fn reset(&mut self) -> Result<()> {
        match self.state {
            CursorState::Closed       => return Err(SomaError::Closed(self.uri.clone())),
            CursorState::Unconfigured => return Err(SomaError::NotConfigured(self.uri.clone())),
            _ => {}
        }
        if let Some(h) = self.handle.as_mut() {
            h.reset();
        }
        if let Some(b) = self.buffers.as_mut() {
            b.clear();
        }
        self.delivered = false;
        self.state     = CursorState::Configured;
        debug!(uri = %self.uri, "cursor reset");
        Ok(())
    }

    /// 释放引擎句柄与缓冲区；可重复调用
    pub fn close(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        if let Some(mut h) = self.handle.take() {
            h.close();
        }
        self.buffers   = None;
        self.delivered = false;
        self.state     = CursorState::Closed;
        debug!(uri = %self.uri, batches = self.stats.batches, rows = self.stats.rows, "cursor closed");
    }

    // ── 元信息 ────────────────────────────────────────────────────────────

    fn live_handle(&mut self) -> Result<&mut Box<dyn ArrayHandle>> {
        if self.state == CursorState::Closed {
            return Err(SomaError::Closed(self.uri.clone()));
        }
        self.open_handle()?;
        self.handle.as_mut().ok_or_else(|| SomaError::NotConfigured(self.uri.clone()))
    }

    /// 时间窗口内的非空单元格数
    pub fn nnz(&mut self) -> Result<u64> {
        let uri = self.uri.clone();
        self.live_handle()?.nnz().map_err(|e| SomaError::engine("nnz", &uri, e))
    }

    pub fn shape(&mut self) -> Result<Vec<i64>> {
        let uri = self.uri.clone();
        self.live_handle()?.shape().map_err(|e| SomaError::engine("shape", &uri, e))
    }

    /// 投影列的 (名字, 类型)；未配置时按当前列设置计算
    pub fn column_types(&self) -> Result<Vec<(String, ColumnType)>> {
        if self.state == CursorState::Closed {
            return Err(SomaError::Closed(self.uri.clone()));
        }
        let cols = if self.columns.is_empty() {
            self.schema.project(&self.options.column_names)?
        } else {
            self.columns.clone()
        };
        Ok(cols.into_iter().map(|c| (c.name, c.column_type)).collect())
    }

    // ── 写入 ──────────────────────────────────────────────────────────────

    /// 把一批行写入数组（仅 Write 模式）
    pub fn write(&mut self, batch: &BufferSet) -> Result<()> {
        if self.options.mode != OpenMode::Write {
            return Err(SomaError::WrongMode { op: "write", expected: OpenMode::Write, uri: self.uri.clone() });
        }
        let uri = self.uri.clone();
        self.live_handle()?.write(batch).map_err(|e| SomaError::engine("write", &uri, e))?;
        debug!(uri = %uri, rows = batch.row_count(), "batch written");
        Ok(())
    }

    // ── 统计 ──────────────────────────────────────────────────────────────

    pub fn reset_stats(&mut self) { self.stats = CursorStats::default(); }

    /// JSON 形式的统计快照
    pub fn stats_dump(&self) -> String {
        serde_json::json!({
            "uri":   self.uri,
            "state": self.state.name(),
            "stats": self.stats,
        })
        .to_string()
    }
}

impl Drop for QueryCursor {
    fn drop(&mut self) { self.close(); }
}

/// 各列报告的结果行数必须一致，且与缓冲区行数相同
fn result_rows(handle: &dyn ArrayHandle, buffers: &BufferSet, uri: &str) -> Result<usize> {
    let mut rows = None;
    for name in buffers.column_names() {
        let elems = handle.result_buffer_elements(name).ok_or_else(|| {
            SomaError::engine("submit", uri, EngineError::new(format!("no result elements for {name}")))
        })?;
        match rows {
            None                        => rows = Some(elems.rows),
            Some(r) if r == elems.rows  => {}
            Some(r) => {
                return Err(SomaError::engine("submit", uri, EngineError::new(format!(
                    "column {name} reports {} rows, expected {r}", elems.rows,
                ))));
            }
        }
    }
    let rows = rows.unwrap_or(0);
    if rows != buffers.row_count() {
        return Err(SomaError::engine("submit", uri, EngineError::new(format!(
            "engine reported {rows} rows but buffers hold {}", buffers.row_count(),
        ))));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemEngine;
    use crate::field_type::Value;

    fn cursor(opts: CursorOptions) -> QueryCursor {
        let engine = MemEngine::new();
        let schema = ArraySchema::new(vec![
            ColumnSchema::dim("soma_dim_0", ColumnType::Int64, (0, 99)),
            ColumnSchema::attr("soma_data", ColumnType::Float64),
        ]).unwrap();
        engine.create_array("mem://c", schema).unwrap();
        engine.write_rows("mem://c", (0..10).map(|i| vec![Value::Int64(i), Value::Float64(i as f64)]).collect())
            .unwrap();
        QueryCursor::new(Arc::new(engine), "mem://c", opts).unwrap()
    }

    #[test]
    fn lifecycle_states() {
        let mut c = cursor(CursorOptions::read().batch_size(BatchSize::Rows(4)));
        assert_eq!(c.state(), CursorState::Unconfigured);
        assert!(matches!(c.next(), Err(SomaError::NotConfigured(_))));
        c.configure().unwrap();
        assert!(c.buffers().is_none());

        assert_eq!(c.next().unwrap().map(BufferSet::row_count), Some(4));
        assert_eq!(c.state(), CursorState::Submitted);
        assert!(matches!(c.set_dim_points("soma_dim_0", &[1]), Err(SomaError::InvalidState { .. })));
        assert_eq!(c.next().unwrap().map(BufferSet::row_count), Some(4));
        assert_eq!(c.next().unwrap().map(BufferSet::row_count), Some(2));
        assert!(c.is_complete());
        assert!(c.next().unwrap().is_none());

        c.close();
        c.close();
        assert!(matches!(c.next(), Err(SomaError::Closed(_))));
        assert!(matches!(c.column_types(), Err(SomaError::Closed(_))));
        assert_eq!(c.stats().rows, 10);
    }

    #[test]
    fn empty_first_batch_is_delivered_once() {
        let mut c = cursor(CursorOptions::read());
        c.set_dim_points("soma_dim_0", &[50]).unwrap();
        c.configure().unwrap();
        assert_eq!(c.next().unwrap().map(BufferSet::row_count), Some(0));
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn write_requires_write_mode() {
        let mut c = cursor(CursorOptions::read());
        let b = BufferSet::allocate(&c.schema().columns.clone(), crate::buffers::BufferBudget::Rows(1));
        assert!(matches!(c.write(&b), Err(SomaError::WrongMode { .. })));
    }

    #[test]
    fn stats_dump_is_json() {
        let mut c = cursor(CursorOptions::read());
        c.configure().unwrap();
        while c.next().unwrap().is_some() {}
        let v: serde_json::Value = serde_json::from_str(&c.stats_dump()).unwrap();
        assert_eq!(v["stats"]["rows"], 10);
        assert_eq!(v["state"], "exhausted");
        c.reset_stats();
        assert_eq!(c.stats(), &CursorStats::default());
    }
}
