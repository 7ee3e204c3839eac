//! 整数键重建索引（IntIndexer）
//!
//! 把任意一组 int64 键（如持久化的 soma_joinid）映射到稠密位置 `0..n-1`，
//! 再把另一组键批量解析到这些位置。构建与解析都按调用方给定的线程数并行。
//!
//! ```text
//! build(keys, T)
//!   phase 1  keys 切成 T 段连续块 ── 每个 worker 把 (key, offset) 散到 S 个分片桶
//!   phase 2  每个 worker 独占一个分片 ── 按输入顺序插入 FxHashMap，顺带查重
//! resolve(keys, T)
//!   keys / out 同步切成 T 段 ── 每个 worker 只读索引，逐位写出位置或 NOT_FOUND
//! ```
//!
//! 线程数只影响速度，不影响结果。

use std::collections::hash_map::Entry;
use std::time::Instant;

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::common::{Position, Result, SomaError};

/// 键不存在时的哨兵值（与 pandas `Index.get_indexer` 一致）
pub const NOT_FOUND: Position = -1;

// ── KeyIndex ──────────────────────────────────────────────────────────────────

/// 分片哈希表：key → 稠密位置
#[derive(Debug, Default)]
pub(crate) struct KeyIndex {
    shards: Vec<FxHashMap<i64, Position>>,
    len:    usize,
}

impl KeyIndex {
    /// 分片选择用独立的乘法散列取高位，避免与 FxHash 的低位相关
    #[inline]
    fn shard_of(key: i64, num_shards: usize) -> usize {
        let h = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((h >> 32) as usize) % num_shards
    }

    #[inline]
    pub fn get(&self, key: i64) -> Option<Position> {
        if self.shards.is_empty() {
            return None;
        }
        self.shards[Self::shard_of(key, self.shards.len())].get(&key).copied()
    }

    pub fn len(&self)      -> usize { self.len }
    pub fn is_empty(&self) -> bool  { self.len == 0 }
}

// ── IntIndexer ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct IntIndexer {
    index: Option<KeyIndex>,
}

/// 分片内发现的第一个重复：(key, 先出现位置, 重复位置)
type Duplicate = (i64, usize, usize);

impl IntIndexer {
    pub fn new() -> Self { Self::default() }

    /// 新建并立即构建
    pub fn from_keys(keys: &[i64], thread_count: usize) -> Result<Self> {
        let mut idx = Self::new();
        idx.build(keys, thread_count)?;
        Ok(idx)
    }

    pub fn is_built(&self) -> bool { self.index.is_some() }

    pub fn len(&self) -> usize { self.index.as_ref().map_or(0, KeyIndex::len) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get(&self, key: i64) -> Option<Position> {
        self.index.as_ref().and_then(|i| i.get(key))
    }

    pub fn contains(&self, key: i64) -> bool { self.get(key).is_some() }

    /// 构建索引：`keys[i]` 映射到 `i`
    ///
    /// 每个实例只能构建一次；有重复键时拒绝，实例保持未构建状态。
    pub fn build(&mut self, keys: &[i64], thread_count: usize) -> Result<()> {
        if self.index.is_some() {
            return Err(SomaError::IndexAlreadyBuilt);
        }
        let pool    = worker_pool(thread_count)?;
        let started = Instant::now();
        let shards  = thread_count;
        let chunk   = keys.len().div_ceil(thread_count).max(1);

        let (maps, dup) = pool.install(|| {
            // phase 1：按块散列到分片桶
            let scattered: Vec<Vec<Vec<(i64, usize)>>> = keys
                .par_chunks(chunk)
                .enumerate()
                .map(|(c, part)| {
                    let base = c * chunk;
                    let mut buckets: Vec<Vec<(i64, usize)>> = (0..shards)
                        .map(|_| Vec::with_capacity(part.len() / shards + 1))
                        .collect();
                    for (i, &k) in part.iter().enumerate() {
                        buckets[KeyIndex::shard_of(k, shards)].push((k, base + i));
                    }
                    buckets
                })
                .collect();

            // phase 2：每个分片独立建表
            let built: Vec<(FxHashMap<i64, Position>, Option<Duplicate>)> = (0..shards)
                .into_par_iter()
                .map(|s| build_shard(&scattered, s))
                .collect();

            let dup = built.iter().filter_map(|(_, d)| *d).min_by_key(|d| d.2);
            let maps: Vec<_> = built.into_iter().map(|(m, _)| m).collect();
            (maps, dup)
        });

        if let Some((key, first, second)) = dup {
            return Err(SomaError::DuplicateKey { key, first, second });
        }

        debug!(
            keys = keys.len(), threads = thread_count,
            elapsed_us = started.elapsed().as_micros() as u64,
            "int indexer built"
        );
        self.index = Some(KeyIndex { shards: maps, len: keys.len() });
        Ok(())
    }

    /// 解析一组键，输出与输入逐位对应；不存在的键为 NOT_FOUND
    pub fn resolve(&self, keys: &[i64], thread_count: usize) -> Result<Vec<Position>> {
        let mut out = vec![NOT_FOUND; keys.len()];
        self.resolve_into(keys, &mut out, thread_count)?;
        Ok(out)
    }

    /// 解析到调用方提供的输出缓冲区
    pub fn resolve_into(
        &self,
        keys:         &[i64],
        out:          &mut [Position],
        thread_count: usize,
    ) -> Result<()> {
        let index = self.index.as_ref().ok_or(SomaError::IndexNotBuilt)?;
        if out.len() != keys.len() {
            return Err(SomaError::LengthMismatch { expected: keys.len(), actual: out.len() });
        }
        let pool    = worker_pool(thread_count)?;
        let started = Instant::now();
        let chunk   = keys.len().div_ceil(thread_count).max(1);

        pool.install(|| {
            out.par_chunks_mut(chunk)
                .zip(keys.par_chunks(chunk))
                .for_each(|(dst, src)| {
                    for (d, &k) in dst.iter_mut().zip(src) {
                        *d = index.get(k).unwrap_or(NOT_FOUND);
                    }
                });
        });

        debug!(
            keys = keys.len(), threads = thread_count,
            elapsed_us = started.elapsed().as_micros() as u64,
            "int indexer resolved"
        );
        Ok(())
    }
}

fn worker_pool(thread_count: usize) -> Result<rayon::ThreadPool> {
    if thread_count == 0 {
        return Err(SomaError::InvalidThreadCount(thread_count));
    }
    Ok(rayon::ThreadPoolBuilder::new().num_threads(thread_count).build()?)
}

/// 合并所有块在分片 `s` 上的桶；块按顺序、块内按输入顺序，所以位置单调递增
fn build_shard(
    scattered: &[Vec<Vec<(i64, usize)>>],
    s:         usize,
) -> (FxHashMap<i64, Position>, Option<Duplicate>) {
    let cap = scattered.iter().map(|b| b[s].len()).sum();
    let mut map = FxHashMap::with_capacity_and_hasher(cap, Default::default());
    for buckets in scattered {
        for &(k, pos) in &buckets[s] {
            match map.entry(k) {
                Entry::Occupied(e) => {
                    let first = *e.get() as usize;
                    return (map, Some((k, first, pos)));
                }
                Entry::Vacant(e)   => { e.insert(pos as Position); }
            }
        }
    }
    (map, None)
}
