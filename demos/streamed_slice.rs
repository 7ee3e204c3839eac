//! # soma-query 使用案例
//!
//! 1. 在内存引擎里建一个 obs 数组并写入
//! 2. 用小批量游标流式读取一个切片
//! 3. reset 后重放，校验每批 CRC32 一致
//! 4. 用 IntIndexer 把 soma_joinid 映射到稠密位置
//! 5. 导出 Arrow RecordBatch
//!
//! 运行：`RUST_LOG=soma_query=debug cargo run --example streamed_slice`

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use soma_query::arrow_export::to_record_batch;
use soma_query::common::ResultOrder;
use soma_query::config::{BatchSize, PlatformConfig};
use soma_query::engine::MemEngine;
use soma_query::field_type::{ColumnType, Value};
use soma_query::schema::{ArraySchema, ColumnSchema};
use soma_query::{CursorOptions, IntIndexer, QueryCursor};

fn main() -> soma_query::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // ── 1. 建数组 ─────────────────────────────────────────────────────────
    let schema = ArraySchema::new(vec![
        ColumnSchema::dim("soma_joinid", ColumnType::Int64, (0, 1 << 20)),
        ColumnSchema::attr("obs_id", ColumnType::Utf8),
        ColumnSchema::categorical("cell_type", &["B cell", "T cell", "NK cell"]),
        ColumnSchema::attr("n_counts", ColumnType::Float32),
    ])?;
    let engine = Arc::new(MemEngine::new());
    engine.create_array("mem://pbmc/obs", schema.clone())?;
    let rows = (0..1_000i64)
        .map(|i| vec![
            Value::Int64(i * 11 + 3),
            format!("AAACCTG-{i:04}").as_str().into(),
            Value::Int32((i % 3) as i32),
            Value::Float32((i % 97) as f32 * 10.0),
        ])
        .collect();
    let ts = engine.write_rows("mem://pbmc/obs", rows)?;
    println!("wrote 1000 cells at timestamp {ts}");

    // ── 2. 流式读取 ───────────────────────────────────────────────────────
    let config = PlatformConfig::default().with_init_buffer_bytes(4096);
    let mut cursor = QueryCursor::new(
        engine.clone(),
        "mem://pbmc/obs",
        CursorOptions::read()
            .columns(&["soma_joinid", "obs_id", "cell_type"])
            .result_order(ResultOrder::RowMajor)
            .batch_size(BatchSize::Auto)
            .config(config.clone()),
    )?;
    cursor.set_dim_ranges("soma_joinid", &[(1_000, 5_000)])?;
    cursor.set_dim_points("soma_joinid", &[3, 14, 25])?;
    cursor.configure()?;
    println!("nnz={} shape={:?}", cursor.nnz()?, cursor.shape()?);

    let mut joinids = Vec::new();
    let mut first   = Vec::new();
    while let Some(batch) = cursor.next()? {
        first.push(batch.checksum());
        if let Some(col) = batch.column("soma_joinid") {
            joinids.extend(col.i64_values()?);
        }
        println!("  batch: {} rows, {} bytes", batch.row_count(), batch.nbytes());
    }

    // ── 3. 重放 ───────────────────────────────────────────────────────────
    cursor.reset()?;
    let mut again = Vec::new();
    while let Some(batch) = cursor.next()? {
        again.push(batch.checksum());
    }
    println!("replay identical: {}", first == again);
    println!("stats: {}", cursor.stats_dump());

    // ── 4. 重建索引 ───────────────────────────────────────────────────────
    let threads = config.reindexer_threads();
    let indexer = IntIndexer::from_keys(&joinids, threads)?;
    let probe   = [25, 1_005, 4, 14];
    println!("resolve {:?} -> {:?}", probe, indexer.resolve(&probe, threads)?);

    // ── 5. Arrow ─────────────────────────────────────────────────────────
    cursor.reset()?;
    if let Some(batch) = cursor.next()? {
        let rb = to_record_batch(batch, &schema)?;
        println!("arrow batch: {} rows, schema {:?}", rb.num_rows(), rb.schema().fields());
    }
    cursor.close();
    Ok(())
}
