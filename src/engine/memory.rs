//! 内存存储引擎
//!
//! 每个数组是一串带时间戳的写入片段；读取时按打开时间窗口合并片段，
//! 同坐标后写覆盖先写。查询在第一次 submit 时对结果做快照，此后每次
//! submit 从记录的位置继续填充，直到缓冲区装不下下一整行。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::buffers::BufferSet;
use crate::common::{Coord, OpenMode, Result, ResultOrder, SomaError, TimestampRange};
use crate::engine::{
    ArrayHandle, EngineError, EngineResult, QueryStatus, ResultElements, StorageEngine,
};
use crate::field_type::Value;
use crate::schema::ArraySchema;
use crate::selection::{DimSelection, Selection};

// ── 存储结构 ──────────────────────────────────────────────────────────────────

struct Fragment {
    timestamp: u64,
    /// 行按 schema 列顺序排列
    rows:      Vec<Vec<Value>>,
}

struct StoredArray {
    schema:    ArraySchema,
    fragments: Vec<Fragment>,
}

impl StoredArray {
    fn dim_indices(&self) -> Vec<usize> {
        self.schema.columns.iter()
            .enumerate()
            .filter(|(_, c)| c.is_dimension)
            .map(|(i, _)| i)
            .collect()
    }

    /// 时间窗口内可见的单元格；同坐标取最后一次写入，位置保持首次写入顺序
    fn visible_cells(&self, ts: Option<TimestampRange>) -> Vec<Vec<Value>> {
        let dims = self.dim_indices();
        let mut frags: Vec<&Fragment> = self.fragments.iter()
            .filter(|f| ts.map_or(true, |r| r.contains(f.timestamp)))
            .collect();
        frags.sort_by_key(|f| f.timestamp);

        let mut cells: Vec<Vec<Value>>      = Vec::new();
        let mut at: HashMap<Vec<Coord>, usize> = HashMap::new();
        for f in frags {
            for row in &f.rows {
                let key = coords(row, &dims);
                match at.get(&key) {
                    Some(&i) => cells[i] = row.clone(),
                    None     => {
                        at.insert(key, cells.len());
                        cells.push(row.clone());
                    }
                }
            }
        }
        cells
    }
}

fn coords(row: &[Value], dims: &[usize]) -> Vec<Coord> {
    dims.iter().map(|&i| row[i].as_i64().unwrap_or_default()).collect()
}

fn validate_row(schema: &ArraySchema, row: &[Value]) -> Result<()> {
    if row.len() != schema.num_columns() {
        return Err(SomaError::LengthMismatch { expected: schema.num_columns(), actual: row.len() });
    }
    for (col, v) in schema.columns.iter().zip(row) {
        if !v.fits(col.column_type) || (v.is_null() && !col.is_nullable) {
            return Err(SomaError::SchemaMismatch(format!("{v:?} for column {}", col.name)));
        }
        if let Some((lo, hi)) = col.domain {
            match v.as_i64() {
                Some(c) if lo <= c && c <= hi => {}
                _ => return Err(SomaError::SchemaMismatch(format!(
                    "{v} outside domain [{lo},{hi}] of {}", col.name,
                ))),
            }
        }
    }
    Ok(())
}

// ── MemEngine ─────────────────────────────────────────────────────────────────

/// 线程安全的内存引擎
#[derive(Default)]
pub struct MemEngine {
    arrays: RwLock<HashMap<String, Arc<RwLock<StoredArray>>>>,
    clock:  Arc<AtomicU64>,
}

impl MemEngine {
    pub fn new() -> Self { Self::default() }

    /// 创建空数组；维度必须是整数类型
    pub fn create_array(&self, uri: &str, schema: ArraySchema) -> Result<()> {
        if let Some(d) = schema.dimensions().find(|d| !d.column_type.is_integer()) {
            return Err(SomaError::Unsupported(format!(
                "{} dimension {}", d.column_type.type_name(), d.name,
            )));
        }
        let mut arrays = self.arrays.write();
        if arrays.contains_key(uri) {
            return Err(SomaError::ArrayExists(uri.into()));
        }
        arrays.insert(uri.into(), Arc::new(RwLock::new(StoredArray { schema, fragments: vec![] })));
        Ok(())
    }

    pub fn drop_array(&self, uri: &str) -> Result<()> {
        self.arrays.write()
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| SomaError::ArrayNotFound(uri.into()))
    }

    pub fn array_count(&self) -> usize { self.arrays.read().len() }

    fn array(&self, uri: &str) -> Option<Arc<RwLock<StoredArray>>> {
        self.arrays.read().get(uri).cloned()
    }

    /// 以新的时间戳写入一个片段，返回该时间戳
    pub fn write_rows(&self, uri: &str, rows: Vec<Vec<Value>>) -> Result<u64> {
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_rows_at(uri, ts, rows)?;
        Ok(ts)
    }

    /// 以指定时间戳写入一个片段
    pub fn write_rows_at(&self, uri: &str, timestamp: u64, rows: Vec<Vec<Value>>) -> Result<()> {
        let array = self.array(uri).ok_or_else(|| SomaError::ArrayNotFound(uri.into()))?;
        let mut array = array.write();
        for row in &rows {
            validate_row(&array.schema, row)?;
        }
        self.clock.fetch_max(timestamp, Ordering::SeqCst);
        trace!(uri, timestamp, rows = rows.len(), "fragment written");
        array.fragments.push(Fragment { timestamp, rows });
        Ok(())
    }
}

impl StorageEngine for MemEngine {
    fn schema(&self, uri: &str) -> EngineResult<ArraySchema> {
        self.array(uri)
            .map(|a| a.read().schema.clone())
            .ok_or_else(|| EngineError::new(format!("array does not exist: {uri}")))
    }

    fn open(
        &self,
        uri:       &str,
        mode:      OpenMode,
        timestamp: Option<TimestampRange>,
    ) -> EngineResult<Box<dyn ArrayHandle>> {
        let array  = self.array(uri)
            .ok_or_else(|| EngineError::new(format!("array does not exist: {uri}")))?;
        let schema = array.read().schema.clone();
        Ok(Box::new(MemArrayHandle {
            uri: uri.into(), mode, timestamp, array, schema,
            clock:     Arc::clone(&self.clock),
            selection: Selection::new(),
            layout:    ResultOrder::Automatic,
            results:   None,
            position:  0,
            elements:  HashMap::new(),
            closed:    false,
        }))
    }
}

// ── MemArrayHandle ────────────────────────────────────────────────────────────

struct MemArrayHandle {
    uri:       String,
    mode:      OpenMode,
    timestamp: Option<TimestampRange>,
    array:     Arc<RwLock<StoredArray>>,
    schema:    ArraySchema,
    clock:     Arc<AtomicU64>,
    selection: Selection,
    layout:    ResultOrder,
    /// 首次 submit 时的结果快照
    results:   Option<Vec<Vec<Value>>>,
    /// 下一个待写出的结果行
    position:  usize,
    elements:  HashMap<String, ResultElements>,
    closed:    bool,
}

impl MemArrayHandle {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::new(format!("array is closed: {}", self.uri)));
        }
        Ok(())
    }

    fn restart(&mut self) {
        self.results  = None;
        self.position = 0;
        self.elements.clear();
    }

    /// 物化选择结果并按布局排序
    fn materialize(&self) -> Vec<Vec<Value>> {
        let array = self.array.read();
        let dims  = array.dim_indices();
        let names: Vec<&str> = dims.iter().map(|&i| self.schema.columns[i].name.as_str()).collect();

        let mut cells: Vec<Vec<Value>> = array.visible_cells(self.timestamp)
            .into_iter()
            .filter(|row| self.selection.matches(&names, &coords(row, &dims)))
            .collect();

        match self.layout {
            ResultOrder::Automatic   => {}
            ResultOrder::RowMajor    => cells.sort_by_cached_key(|r| coords(r, &dims)),
            ResultOrder::ColumnMajor => cells.sort_by_cached_key(|r| {
                let mut c = coords(r, &dims);
                c.reverse();
                c
            }),
        }
        cells
    }
}

impl ArrayHandle for MemArrayHandle {
    fn uri(&self)    -> &str         { &self.uri }
    fn mode(&self)   -> OpenMode     { self.mode }
    fn schema(&self) -> &ArraySchema { &self.schema }

    fn configure_selection(&mut self, dim: &str, selection: &DimSelection) -> EngineResult<()> {
        self.ensure_open()?;
        self.schema.selectable_dim(dim).map_err(|e| EngineError::new(e.to_string()))?;
        self.selection.set_dim(dim, selection.clone());
        self.restart();
        Ok(())
    }

    fn clear_selection(&mut self) {
        self.selection.clear();
        self.restart();
    }

    fn set_layout(&mut self, order: ResultOrder) -> EngineResult<()> {
        self.ensure_open()?;
        self.layout = order;
        Ok(())
    }

    fn submit(&mut self, buffers: &mut BufferSet) -> EngineResult<QueryStatus> {
        self.ensure_open()?;
        if self.mode != OpenMode::Read {
            return Err(EngineError::new(format!("submit on array opened for write: {}", self.uri)));
        }
        let projection: Vec<usize> = buffers.column_names().iter()
            .map(|n| {
                self.schema.index_of(n)
                    .ok_or_else(|| EngineError::new(format!("no such column: {n}")))
            })
            .collect::<EngineResult<_>>()?;

        if self.results.is_none() {
            self.results = Some(self.materialize());
        }
        let results = self.results.as_deref().unwrap_or_default();

        buffers.clear();
        let mut row: Vec<Value> = Vec::with_capacity(projection.len());
        while let Some(cell) = results.get(self.position) {
            row.clear();
            row.extend(projection.iter().map(|&i| cell[i].clone()));
            if !buffers.try_push_row(&row).map_err(|e| EngineError::new(e.to_string()))? {
                break;
            }
            self.position += 1;
        }

        let filled: &BufferSet = buffers;
        self.elements = filled.column_names().into_iter()
            .filter_map(|n| ResultElements::of(filled, n).map(|e| (n.to_string(), e)))
            .collect();

        let status = if self.position >= results.len() {
            QueryStatus::Complete
        } else {
            QueryStatus::Incomplete
        };
        trace!(
            uri = %self.uri, rows = buffers.row_count(),
            position = self.position, total = results.len(), ?status,
            "submit"
        );
        Ok(status)
    }

    fn result_buffer_elements(&self, column: &str) -> Option<ResultElements> {
        self.elements.get(column).copied()
    }

    fn reset(&mut self) { self.restart(); }

    fn write(&mut self, buffers: &BufferSet) -> EngineResult<()> {
        self.ensure_open()?;
        if self.mode != OpenMode::Write {
            return Err(EngineError::new(format!("write on array opened for read: {}", self.uri)));
        }
        // 写入批次必须覆盖全部列，顺序任意
        let order: Vec<usize> = self.schema.columns.iter()
            .map(|c| {
                buffers.column_index(&c.name)
                    .ok_or_else(|| EngineError::new(format!("write is missing column {}", c.name)))
            })
            .collect::<EngineResult<_>>()?;

        let mut rows = Vec::with_capacity(buffers.row_count());
        for r in 0..buffers.row_count() {
            let row: Vec<Value> = order.iter()
                .map(|&i| buffers.value(i, r).unwrap_or(Value::Null))
                .collect();
            validate_row(&self.schema, &row).map_err(|e| EngineError::new(e.to_string()))?;
            rows.push(row);
        }
        let ts = match self.timestamp {
            Some(t) => { self.clock.fetch_max(t.end, Ordering::SeqCst); t.end }
            None    => self.clock.fetch_add(1, Ordering::SeqCst) + 1,
        };
        trace!(uri = %self.uri, timestamp = ts, rows = rows.len(), "fragment written");
        self.array.write().fragments.push(Fragment { timestamp: ts, rows });
        Ok(())
    }

    fn nnz(&self) -> EngineResult<u64> {
        self.ensure_open()?;
        Ok(self.array.read().visible_cells(self.timestamp).len() as u64)
    }

    /// 每个维度上可见的最大坐标 + 1
    fn shape(&self) -> EngineResult<Vec<i64>> {
        self.ensure_open()?;
        let array = self.array.read();
        let dims  = array.dim_indices();
        let mut shape = vec![0i64; dims.len()];
        for cell in array.visible_cells(self.timestamp) {
            for (s, c) in shape.iter_mut().zip(coords(&cell, &dims)) {
                *s = (*s).max(c + 1);
            }
        }
        Ok(shape)
    }

    fn close(&mut self) {
        self.closed = true;
        self.restart();
    }
}
