//! 维度选择：点集 ∪ 闭区间
//!
//! 同一维度上的点选择与区间选择取并集；某维度没有任何选择即不受限；
//! 多个维度之间取交集。

use std::collections::BTreeMap;

use crate::common::{Coord, Result, SomaError};
use crate::schema::ArraySchema;

// ── DimSelection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimSelection {
    /// 已排序去重
    points: Vec<Coord>,
    /// [lo, hi] 闭区间
    ranges: Vec<(Coord, Coord)>,
}

impl DimSelection {
    pub fn points(&self) -> &[Coord]          { &self.points }
    pub fn ranges(&self) -> &[(Coord, Coord)] { &self.ranges }

    pub fn is_empty(&self) -> bool { self.points.is_empty() && self.ranges.is_empty() }

    pub fn matches(&self, v: Coord) -> bool {
        self.is_empty()
            || self.points.binary_search(&v).is_ok()
            || self.ranges.iter().any(|&(lo, hi)| lo <= v && v <= hi)
    }

    fn set_points(&mut self, points: &[Coord]) {
        let mut p = points.to_vec();
        p.sort_unstable();
        p.dedup();
        self.points = p;
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    dims: BTreeMap<String, DimSelection>,
}

impl Selection {
    pub fn new() -> Self { Self::default() }

    /// 替换该维度的点选择（区间选择保留）
    pub fn set_points(&mut self, dim: &str, points: &[Coord]) {
        self.dims.entry(dim.into()).or_default().set_points(points);
    }

    /// 替换该维度的区间选择（点选择保留）
    pub fn set_ranges(&mut self, dim: &str, ranges: &[(Coord, Coord)]) -> Result<()> {
        if let Some(&(lo, hi)) = ranges.iter().find(|(lo, hi)| lo > hi) {
            return Err(SomaError::InvalidRange { dim: dim.into(), lo, hi });
        }
        self.dims.entry(dim.into()).or_default().ranges = ranges.to_vec();
        Ok(())
    }

    /// 整体替换该维度的选择
    pub fn set_dim(&mut self, dim: &str, selection: DimSelection) {
        self.dims.insert(dim.into(), selection);
    }

    pub fn dim(&self, name: &str) -> Option<&DimSelection> { self.dims.get(name) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DimSelection)> {
        self.dims.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 所有维度都没有选择
    pub fn is_unrestricted(&self) -> bool { self.dims.values().all(DimSelection::is_empty) }

    pub fn clear(&mut self) { self.dims.clear(); }

    /// 每个被选择的名字都必须是可选择的整数维度
    pub fn validate(&self, schema: &ArraySchema) -> Result<()> {
        for name in self.dims.keys() {
            schema.selectable_dim(name)?;
        }
        Ok(())
    }

    /// `coords` 与 `dim_names` 按位置对应
    pub fn matches(&self, dim_names: &[&str], coords: &[Coord]) -> bool {
        dim_names.iter().zip(coords).all(|(name, &c)| {
            self.dims.get(*name).map_or(true, |d| d.matches(c))
        })
    }
}

// ── 点集分区 ──────────────────────────────────────────────────────────────────

/// 把点列表切成 `partition_count` 段近似等长的连续分区，返回第 `partition_index` 段
///
/// 余数分给前面的分区，多路并发读取时各路拿到互不重叠的子集。
pub fn partition_points(
    points:          &[Coord],
    partition_index: usize,
    partition_count: usize,
) -> Result<&[Coord]> {
    if partition_count == 0 || partition_index >= partition_count {
        return Err(SomaError::InvalidPartition { index: partition_index, count: partition_count });
    }
    let size  = points.len() / partition_count;
    let rem   = points.len() % partition_count;
    let start = partition_index * size + partition_index.min(rem);
    let len   = size + usize::from(partition_index < rem);
    Ok(&points[start..start + len])
}
