use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use soma_query::buffers::{BufferBudget, BufferSet};
use soma_query::common::{OpenMode, ResultOrder, TimestampRange};
use soma_query::config::{BatchSize, PlatformConfig};
use soma_query::engine::{
    ArrayHandle, EngineError, EngineResult, MemEngine, QueryStatus, ResultElements, StorageEngine,
};
use soma_query::field_type::{ColumnType, Value};
use soma_query::schema::{ArraySchema, ColumnSchema};
use soma_query::selection::DimSelection;
use soma_query::{CursorOptions, CursorState, QueryCursor, SomaError};

const URI: &str = "mem://obs_x";

fn matrix_schema() -> ArraySchema {
    ArraySchema::new(vec![
        ColumnSchema::dim("soma_dim_0", ColumnType::Int64, (0, 999)),
        ColumnSchema::dim("soma_dim_1", ColumnType::Int64, (0, 999)),
        ColumnSchema::attr("soma_data", ColumnType::Float32),
        ColumnSchema::attr("label", ColumnType::Utf8).nullable(),
    ]).unwrap()
}

/// 20 × 10 的稀疏矩阵，按随机顺序写入
fn matrix_engine() -> Arc<MemEngine> {
    let engine = MemEngine::new();
    engine.create_array(URI, matrix_schema()).unwrap();
    let mut rows: Vec<Vec<Value>> = (0..20)
        .flat_map(|i| (0..10).map(move |j| (i, j)))
        .map(|(i, j)| {
            let label = if (i + j) % 5 == 0 { Value::Null } else { format!("cell-{i}-{j}").as_str().into() };
            vec![Value::Int64(i), Value::Int64(j), Value::Float32((i * 10 + j) as f32), label]
        })
        .collect();
    rows.shuffle(&mut StdRng::seed_from_u64(5));
    engine.write_rows(URI, rows).unwrap();
    Arc::new(engine)
}

fn drain(cursor: &mut QueryCursor) -> Vec<Vec<Value>> {
    let mut out = vec![];
    while let Some(batch) = cursor.next().unwrap() {
        out.extend((0..batch.row_count()).map(|r| batch.row(r).unwrap()));
    }
    out
}

fn read_all(engine: Arc<MemEngine>, opts: CursorOptions) -> Vec<Vec<Value>> {
    let mut c = QueryCursor::new(engine, URI, opts).unwrap();
    c.configure().unwrap();
    drain(&mut c)
}

#[test]
fn batches_concatenate_to_unbounded_fetch() {
    let engine = matrix_engine();
    let ordered = CursorOptions::read().result_order(ResultOrder::RowMajor);
    let whole   = read_all(engine.clone(), ordered.clone().batch_size(BatchSize::Rows(100_000)));
    let batched = read_all(engine, ordered.batch_size(BatchSize::Rows(7)));
    assert_eq!(whole.len(), 200);
    assert_eq!(batched, whole);
    assert_eq!(whole[0][..2], [Value::Int64(0), Value::Int64(0)]);
    assert_eq!(whole[199][..2], [Value::Int64(19), Value::Int64(9)]);
}

#[test]
fn column_major_orders_by_last_dimension_first() {
    let rows = read_all(matrix_engine(), CursorOptions::read().result_order(ResultOrder::ColumnMajor));
    let coords: Vec<(Value, Value)> = rows.into_iter().map(|r| (r[0].clone(), r[1].clone())).collect();
    assert_eq!(coords[0], (Value::Int64(0), Value::Int64(0)));
    assert_eq!(coords[1], (Value::Int64(1), Value::Int64(0)));
    assert_eq!(coords[20], (Value::Int64(0), Value::Int64(1)));
}

#[test]
fn reset_replays_identical_batches() {
    let mut c = QueryCursor::new(
        matrix_engine(), URI,
        CursorOptions::read().result_order(ResultOrder::RowMajor).batch_size(BatchSize::Rows(16)),
    ).unwrap();
    c.set_dim_ranges("soma_dim_0", &[(3, 12)]).unwrap();
    c.configure().unwrap();

    let mut runs = vec![];
    for _ in 0..2 {
        let mut sums = vec![];
        while let Some(b) = c.next().unwrap() {
            sums.push((b.row_count(), b.checksum()));
        }
        assert!(c.is_complete());
        runs.push(sums);
        c.reset().unwrap();
        assert_eq!(c.state(), CursorState::Configured);
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].iter().map(|s| s.0).sum::<usize>(), 100);
}

#[test]
fn empty_selection_returns_every_row() {
    let engine = matrix_engine();
    let mut c = QueryCursor::new(engine.clone(), URI, CursorOptions::read()).unwrap();
    c.set_dim_points("soma_dim_0", &[]).unwrap();
    c.set_dim_ranges("soma_dim_1", &[]).unwrap();
    c.configure().unwrap();
    assert_eq!(drain(&mut c).len(), 200);
    assert_eq!(read_all(engine, CursorOptions::read()).len(), 200);
}

#[test]
fn points_and_ranges_union_and_dimensions_intersect() {
    let mut c = QueryCursor::new(matrix_engine(), URI, CursorOptions::read()).unwrap();
    c.set_dim_points("soma_dim_0", &[1, 15]).unwrap();
    c.set_dim_ranges("soma_dim_0", &[(4, 5)]).unwrap();
    c.set_dim_points("soma_dim_1", &[9]).unwrap();
    c.configure().unwrap();
    let mut got: Vec<i64> = drain(&mut c).iter().filter_map(|r| r[0].as_i64()).collect();
    got.sort_unstable();
    assert_eq!(got, vec![1, 4, 5, 15]);
}

#[test]
fn partitions_split_point_reads_without_overlap() {
    let engine = matrix_engine();
    let points: Vec<i64> = (0..20).collect();
    let mut seen = vec![];
    for part in 0..3 {
        let mut c = QueryCursor::new(engine.clone(), URI, CursorOptions::read().columns(&["soma_dim_0"])).unwrap();
        c.set_dim_points_partitioned("soma_dim_0", &points, part, 3).unwrap();
        c.configure().unwrap();
        seen.extend(drain(&mut c).into_iter().filter_map(|r| r[0].as_i64()));
    }
    seen.sort_unstable();
    assert_eq!(seen.len(), 200);
    seen.dedup();
    assert_eq!(seen, points);
}

#[test]
fn tiny_byte_budget_regrows_until_a_row_fits() {
    let engine = MemEngine::new();
    let schema = ArraySchema::new(vec![
        ColumnSchema::dim("soma_joinid", ColumnType::Int64, (0, 10)),
        ColumnSchema::attr("obs_id", ColumnType::Utf8),
    ]).unwrap();
    engine.create_array("mem://obs", schema).unwrap();
    let long = "ACGT".repeat(1000);
    engine.write_rows("mem://obs", vec![
        vec![Value::Int64(0), long.as_str().into()],
        vec![Value::Int64(1), "short".into()],
    ]).unwrap();

    let mut c = QueryCursor::new(
        Arc::new(engine), "mem://obs", CursorOptions::read().batch_size(BatchSize::Bytes(8)),
    ).unwrap();
    c.configure().unwrap();
    let first = c.next().unwrap().unwrap();
    assert_eq!(first.column("obs_id").unwrap().str_value(0), Some(long.as_str()));
    let rows = 1 + drain(&mut c).len();
    assert_eq!(rows, 2);
    assert!(c.stats().regrowths >= 1);
    assert!(c.stats().bytes_grown >= (long.len() - 8) as u64);
}

#[test]
fn repeated_projection_is_a_configuration_error() {
    let engine = MemEngine::new();
    engine.create_array("mem://obs", ArraySchema::new(vec![
        ColumnSchema::dim("soma_joinid", ColumnType::Int64, (0, 10)),
        ColumnSchema::attr("s", ColumnType::Utf8),
    ]).unwrap()).unwrap();
    engine.write_rows("mem://obs", vec![vec![Value::Int64(0), "x".repeat(500).as_str().into()]]).unwrap();
    let engine = Arc::new(engine);

    let mut c = QueryCursor::new(
        engine.clone(), "mem://obs",
        CursorOptions::read().columns(&["s", "s"]).batch_size(BatchSize::Rows(1)),
    ).unwrap();
    assert!(matches!(c.configure(), Err(SomaError::SchemaMismatch(_))));

    let mut c = QueryCursor::new(engine, "mem://obs", CursorOptions::read().batch_size(BatchSize::Rows(1))).unwrap();
    assert!(matches!(c.select_columns(&["s", "soma_joinid", "s"]), Err(SomaError::SchemaMismatch(_))));
    c.select_columns(&["s"]).unwrap();
    c.configure().unwrap();
    let rows = drain(&mut c);
    assert_eq!(rows, vec![vec![Value::Utf8("x".repeat(500))]]);
}

#[test]
fn timestamp_range_hides_later_writes() {
    let engine = MemEngine::new();
    engine.create_array(URI, matrix_schema()).unwrap();
    let cell = |v: f32| vec![Value::Int64(1), Value::Int64(1), Value::Float32(v), Value::Null];
    engine.write_rows_at(URI, 10, vec![cell(1.0)]).unwrap();
    engine.write_rows_at(URI, 20, vec![cell(2.0)]).unwrap();
    let engine = Arc::new(engine);

    let old = read_all(engine.clone(), CursorOptions::read().timestamp(TimestampRange::up_to(15)));
    let new = read_all(engine.clone(), CursorOptions::read());
    assert_eq!(old[0][2], Value::Float32(1.0));
    assert_eq!(new[0][2], Value::Float32(2.0));
    assert!(read_all(engine, CursorOptions::read().timestamp(TimestampRange::up_to(5)))
        .is_empty());
}

#[test]
fn write_mode_round_trip() {
    let engine = Arc::new(MemEngine::new());
    engine.create_array(URI, matrix_schema()).unwrap();

    let mut w = QueryCursor::new(engine.clone(), URI, CursorOptions::write()).unwrap();
    w.configure().unwrap();
    assert!(matches!(w.next(), Err(SomaError::WrongMode { .. })));
    let mut batch = BufferSet::allocate(&w.schema().columns.clone(), BufferBudget::Rows(2));
    for i in 0..5 {
        batch.append_row(&[Value::Int64(i), Value::Int64(0), Value::Float32(0.5), "w".into()]).unwrap();
    }
    w.write(&batch).unwrap();
    w.close();

    let mut r = QueryCursor::new(engine, URI, CursorOptions::read().columns(&["label", "soma_dim_0"])).unwrap();
    assert_eq!(r.nnz().unwrap(), 5);
    assert_eq!(r.shape().unwrap(), vec![5, 1]);
    r.configure().unwrap();
    let rows = drain(&mut r);
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0], vec![Value::Utf8("w".into()), Value::Int64(0)]);
}

#[test]
fn metadata_queries() {
    let mut c = QueryCursor::new(matrix_engine(), URI, CursorOptions::read().columns(&["soma_data"])).unwrap();
    assert_eq!(c.ndim(), 2);
    assert_eq!(c.column_types().unwrap(), vec![("soma_data".to_string(), ColumnType::Float32)]);
    assert_eq!(c.nnz().unwrap(), 200);
    assert_eq!(c.shape().unwrap(), vec![20, 10]);
}

#[test]
fn configuration_errors_surface_synchronously() {
    let engine = matrix_engine();
    let mut c = QueryCursor::new(engine.clone(), URI, CursorOptions::read()).unwrap();
    assert!(matches!(c.select_columns(&["nope"]), Err(SomaError::UnknownColumn(_))));
    assert!(matches!(c.set_dim_points("soma_data", &[1]), Err(SomaError::NotADimension(_))));
    assert!(matches!(c.set_dim_points("nope", &[1]), Err(SomaError::UnknownColumn(_))));
    assert!(matches!(c.set_dim_ranges("soma_dim_0", &[(9, 1)]), Err(SomaError::InvalidRange { .. })));
    assert!(matches!(
        c.set_dim_points_partitioned("soma_dim_0", &[1, 2], 2, 2),
        Err(SomaError::InvalidPartition { index: 2, count: 2 })
    ));
    c.set_batch_size(BatchSize::Rows(0)).unwrap();
    assert!(matches!(c.configure(), Err(SomaError::InvalidBatchSize(_))));

    let missing = QueryCursor::new(engine, "mem://missing", CursorOptions::read()).unwrap_err();
    assert!(matches!(missing, SomaError::Engine { op: "schema", .. }));
}

#[test]
fn reconfigure_after_setter_keeps_cursor_usable() {
    let mut c = QueryCursor::new(matrix_engine(), URI, CursorOptions::read()).unwrap();
    c.configure().unwrap();
    c.set_dim_points("soma_dim_0", &[0]).unwrap();
    assert_eq!(c.state(), CursorState::Configured);
    assert_eq!(drain(&mut c).len(), 10);
}

// ── 不配合的引擎 ──────────────────────────────────────────────────────────────

/// 每次都要求比当前容量大得多的空间，永远写不下一行
struct Starving;

struct StarvingHandle {
    schema: ArraySchema,
}

impl StorageEngine for Starving {
    fn schema(&self, _uri: &str) -> EngineResult<ArraySchema> {
        Ok(ArraySchema::new(vec![
            ColumnSchema::dim("soma_joinid", ColumnType::Int64, (0, 10)),
            ColumnSchema::attr("s", ColumnType::Utf8),
        ]).unwrap())
    }

    fn open(&self, uri: &str, _mode: OpenMode, _ts: Option<TimestampRange>) -> EngineResult<Box<dyn ArrayHandle>> {
        Ok(Box::new(StarvingHandle { schema: self.schema(uri)? }))
    }
}

impl ArrayHandle for StarvingHandle {
    fn uri(&self)    -> &str         { "starving" }
    fn mode(&self)   -> OpenMode     { OpenMode::Read }
    fn schema(&self) -> &ArraySchema { &self.schema }

    fn configure_selection(&mut self, _dim: &str, _sel: &DimSelection) -> EngineResult<()> { Ok(()) }
    fn clear_selection(&mut self) {}
    fn set_layout(&mut self, _order: ResultOrder) -> EngineResult<()> { Ok(()) }

    fn submit(&mut self, buffers: &mut BufferSet) -> EngineResult<QueryStatus> {
        let cap = buffers.column("s").map_or(0, |c| c.data_capacity());
        let big = "x".repeat(cap * 4 + 1);
        let ok  = buffers.try_push_row(&[Value::Int64(0), big.as_str().into()])
            .map_err(|e| EngineError::new(e.to_string()))?;
        assert!(!ok);
        Ok(QueryStatus::Incomplete)
    }

    fn result_buffer_elements(&self, _column: &str) -> Option<ResultElements> {
        Some(ResultElements::default())
    }

    fn reset(&mut self) {}
    fn write(&mut self, _buffers: &BufferSet) -> EngineResult<()> {
        Err(EngineError::new("read only").with_code(-1))
    }
    fn nnz(&self)   -> EngineResult<u64>      { Ok(1) }
    fn shape(&self) -> EngineResult<Vec<i64>> { Ok(vec![1]) }
    fn close(&mut self) {}
}

#[test]
fn regrowth_gives_up_after_the_configured_attempts() {
    let cfg = PlatformConfig { max_regrow_attempts: 3, ..PlatformConfig::default() };
    let mut c = QueryCursor::new(
        Arc::new(Starving), "starving",
        CursorOptions::read().batch_size(BatchSize::Rows(1)).config(cfg),
    ).unwrap();
    c.configure().unwrap();
    match c.next() {
        Err(SomaError::BufferTooSmall { column, attempts }) => {
            assert_eq!(column, "s");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected BufferTooSmall, got {other:?}"),
    }
    assert_eq!(c.stats().submissions, 4);
    assert_eq!(c.stats().regrowths, 3);
}
