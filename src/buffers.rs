//! 结果缓冲区（一批结果的列存内存）
//!
//! ```text
//! BufferSet
//!   ├─ row_count                      所有列共享的逻辑行数
//!   └─ ColumnBuffer × N
//!        ├─ data      (LE 编码，定长列 rows × width / 变长列扁平字节)
//!        ├─ offsets   (仅变长列，rows + 1 个 u64)
//!        └─ validity  (仅可空列，每行 1 字节，1 = 有效)
//! ```
//!
//! BufferSet 只拥有并标注字节的类型，不解释内容；引擎在 submit 时
//! 就地写入，游标在每次 next 之前清空重用。

use byteorder::{ByteOrder, LittleEndian};

use crate::common::{Result, SomaError};
use crate::field_type::{ColumnType, Value};
use crate::schema::ColumnSchema;

/// 行预算下变长列每行的初始字节估计（可能不够，由游标扩容）
pub const VAR_BYTES_PER_ROW_GUESS: usize = 64;

/// 缓冲区预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBudget {
    /// 每列行数
    Rows(usize),
    /// 每列总字节数；变长列的 offsets 也从中扣除
    Bytes(usize),
}

// ── ColumnBuffer ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ColumnBuffer {
    schema:       ColumnSchema,
    /// 长度即容量（预先清零分配）
    data:         Vec<u8>,
    data_len:     usize,
    offsets:      Option<Vec<u64>>,
    validity:     Option<Vec<u8>>,
    rows:         usize,
    row_capacity: usize,
    /// 最近一次写入失败时本列需要的数据字节数
    shortfall:    Option<usize>,
}

impl ColumnBuffer {
    fn allocate(schema: &ColumnSchema, budget: BufferBudget) -> Self {
        let ty = schema.column_type;
        let (data_bytes, row_capacity) = match (ty.fixed_size(), budget) {
            (Some(w), BufferBudget::Rows(n))  => (n * w, n),
            (Some(w), BufferBudget::Bytes(b)) => ((b / w) * w, b / w),
            (None,    BufferBudget::Rows(n))  => (n * VAR_BYTES_PER_ROW_GUESS, n),
            // 预算一半给 offsets（至少一行），其余给数据区
            (None,    BufferBudget::Bytes(b)) => {
                let rows = (b / 16).max(1);
                (b.saturating_sub(rows * 8), rows)
            }
        };
        Self {
            schema:   schema.clone(),
            data:     vec![0u8; data_bytes],
            data_len: 0,
            offsets:  ty.is_var().then(|| vec![0u64; row_capacity + 1]),
            validity: schema.is_nullable.then(|| vec![0u8; row_capacity]),
            rows:     0,
            row_capacity,
            shortfall: None,
        }
    }

    pub fn schema(&self)        -> &ColumnSchema { &self.schema }
    pub fn name(&self)          -> &str          { &self.schema.name }
    pub fn column_type(&self)   -> ColumnType    { self.schema.column_type }
    pub fn rows(&self)          -> usize         { self.rows }
    pub fn row_capacity(&self)  -> usize         { self.row_capacity }
    pub fn data_capacity(&self) -> usize         { self.data.len() }
    pub fn shortfall(&self)     -> Option<usize> { self.shortfall }

    /// 已填充的数据字节
    pub fn data(&self) -> &[u8] { &self.data[..self.data_len] }

    /// 已填充的 offsets（rows + 1 个）
    pub fn offsets(&self) -> Option<&[u64]> {
        self.offsets.as_deref().map(|o| &o[..self.rows + 1])
    }

    /// 已填充的有效位（每行 1 字节）
    pub fn validity(&self) -> Option<&[u8]> {
        self.validity.as_deref().map(|v| &v[..self.rows])
    }

    pub fn is_valid(&self, row: usize) -> bool {
        self.validity().map_or(row < self.rows, |v| v.get(row).copied() == Some(1))
    }

    pub fn null_count(&self) -> usize {
        self.validity().map_or(0, |v| v.iter().filter(|&&b| b == 0).count())
    }

    fn clear(&mut self) {
        self.rows      = 0;
        self.data_len  = 0;
        self.shortfall = None;
    }

    /// 写入本值所需的数据字节
    fn bytes_for(&self, v: &Value) -> usize {
        match self.column_type().fixed_size() {
            Some(w) => w,
            None    => v.as_bytes().map_or(0, <[u8]>::len),
        }
    }

    fn check_value(&self, v: &Value) -> Result<()> {
        if v.is_null() && !self.schema.is_nullable {
            return Err(SomaError::SchemaMismatch(format!("null in non-nullable {}", self.name())));
        }
        if !v.fits(self.column_type()) {
            return Err(SomaError::SchemaMismatch(format!(
                "{v:?} does not fit {} column {}", self.column_type().type_name(), self.name(),
            )));
        }
        Ok(())
    }

    /// 容量检查；不足时记录 shortfall
    fn has_room(&mut self, v: &Value) -> bool {
        let need = self.data_len + self.bytes_for(v);
        if self.rows < self.row_capacity && need <= self.data.len() {
            return true;
        }
        self.shortfall = Some(need.max(self.data_len + 1));
        false
    }

    fn push(&mut self, v: &Value) {
        let start = self.data_len;
        let n     = self.bytes_for(v);
        let dst   = &mut self.data[start..start + n];
        match v {
            Value::Null       => dst.fill(0),
            Value::Int8(x)    => dst[0] = *x as u8,
            Value::UInt8(x)   => dst[0] = *x,
            Value::Bool(x)    => dst[0] = *x as u8,
            Value::Int16(x)   => LittleEndian::write_i16(dst, *x),
            Value::UInt16(x)  => LittleEndian::write_u16(dst, *x),
            Value::Int32(x)   => LittleEndian::write_i32(dst, *x),
            Value::UInt32(x)  => LittleEndian::write_u32(dst, *x),
            Value::Int64(x)   => LittleEndian::write_i64(dst, *x),
            Value::UInt64(x)  => LittleEndian::write_u64(dst, *x),
            Value::Float32(x) => LittleEndian::write_f32(dst, *x),
            Value::Float64(x) => LittleEndian::write_f64(dst, *x),
            Value::Utf8(s)    => dst.copy_from_slice(s.as_bytes()),
            Value::Bytes(b)   => dst.copy_from_slice(b),
        }
        self.data_len += n;
        if let Some(off) = self.offsets.as_mut() {
            off[self.rows + 1] = self.data_len as u64;
        }
        if let Some(val) = self.validity.as_mut() {
            val[self.rows] = !v.is_null() as u8;
        }
        self.rows += 1;
    }

    /// 扩容数据区，保留已填充前缀
    fn grow(&mut self, new_byte_size: usize) -> Result<()> {
        let old = self.data.len();
        if new_byte_size < old {
            return Err(SomaError::Unsupported(format!(
                "shrinking buffer {} from {old} to {new_byte_size} bytes", self.name(),
            )));
        }
        self.data.resize(new_byte_size, 0);
        let new_rows = match self.column_type().fixed_size() {
            Some(w) => new_byte_size / w,
            // 变长列按数据区倍数放大行容量，至少多一行
            None => (self.row_capacity * new_byte_size / old.max(1)).max(self.row_capacity + 1),
        };
        if new_rows > self.row_capacity {
            self.row_capacity = new_rows;
            if let Some(off) = self.offsets.as_mut() { off.resize(new_rows + 1, 0); }
            if let Some(val) = self.validity.as_mut() { val.resize(new_rows, 0); }
        }
        self.shortfall = None;
        Ok(())
    }

    /// 解码一行
    pub fn value(&self, row: usize) -> Option<Value> {
        if row >= self.rows {
            return None;
        }
        if !self.is_valid(row) {
            return Some(Value::Null);
        }
        if let Some(off) = self.offsets.as_deref() {
            let b = &self.data[off[row] as usize..off[row + 1] as usize];
            return Some(match self.column_type() {
                ColumnType::Utf8 => Value::Utf8(String::from_utf8_lossy(b).into_owned()),
                _                => Value::Bytes(b.to_vec()),
            });
        }
        let w = self.column_type().fixed_size()?;
        let b = &self.data[row * w..(row + 1) * w];
        Some(match self.column_type() {
            ColumnType::Int8    => Value::Int8(b[0] as i8),
            ColumnType::UInt8   => Value::UInt8(b[0]),
            ColumnType::Bool    => Value::Bool(b[0] != 0),
            ColumnType::Int16   => Value::Int16(LittleEndian::read_i16(b)),
            ColumnType::UInt16  => Value::UInt16(LittleEndian::read_u16(b)),
            ColumnType::Int32
                | ColumnType::Categorical => Value::Int32(LittleEndian::read_i32(b)),
            ColumnType::UInt32  => Value::UInt32(LittleEndian::read_u32(b)),
            ColumnType::Int64
                | ColumnType::Timestamp(_) => Value::Int64(LittleEndian::read_i64(b)),
            ColumnType::UInt64  => Value::UInt64(LittleEndian::read_u64(b)),
            ColumnType::Float32 => Value::Float32(LittleEndian::read_f32(b)),
            ColumnType::Float64 => Value::Float64(LittleEndian::read_f64(b)),
            ColumnType::Utf8 | ColumnType::Binary => return None,
        })
    }

    /// 整数列按 i64 读出（维度列常用，例如送入 IntIndexer）
    pub fn i64_values(&self) -> Result<Vec<i64>> {
        let ty = self.column_type();
        if ty == ColumnType::Int64 || matches!(ty, ColumnType::Timestamp(_)) {
            let mut out = vec![0i64; self.rows];
            LittleEndian::read_i64_into(self.data(), &mut out);
            return Ok(out);
        }
        if !ty.is_integer() {
            return Err(SomaError::Unsupported(format!(
                "i64 view of {} column {}", ty.type_name(), self.name(),
            )));
        }
        (0..self.rows)
            .map(|r| {
                self.value(r)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| SomaError::Unsupported(format!("u64 overflow in {}", self.name())))
            })
            .collect()
    }

    pub fn f64_values(&self) -> Result<Vec<f64>> {
        match self.column_type() {
            ColumnType::Float64 => {
                let mut out = vec![0f64; self.rows];
                LittleEndian::read_f64_into(self.data(), &mut out);
                Ok(out)
            }
            ColumnType::Float32 => {
                let mut out = vec![0f32; self.rows];
                LittleEndian::read_f32_into(self.data(), &mut out);
                Ok(out.into_iter().map(f64::from).collect())
            }
            ty => Err(SomaError::Unsupported(format!(
                "f64 view of {} column {}", ty.type_name(), self.name(),
            ))),
        }
    }

    pub fn str_value(&self, row: usize) -> Option<&str> {
        if self.column_type() != ColumnType::Utf8 || row >= self.rows || !self.is_valid(row) {
            return None;
        }
        let off = self.offsets.as_deref()?;
        std::str::from_utf8(&self.data[off[row] as usize..off[row + 1] as usize]).ok()
    }

    fn hash_into(&self, h: &mut crc32fast::Hasher) {
        h.update(self.data());
        if let Some(off) = self.offsets() {
            let mut bytes = vec![0u8; off.len() * 8];
            LittleEndian::write_u64_into(off, &mut bytes);
            h.update(&bytes);
        }
        if let Some(val) = self.validity() {
            h.update(val);
        }
    }
}

// ── BufferSet ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BufferSet {
    columns:   Vec<ColumnBuffer>,
    row_count: usize,
}

impl BufferSet {
    pub fn allocate(columns: &[ColumnSchema], budget: BufferBudget) -> Self {
        Self {
            columns:   columns.iter().map(|c| ColumnBuffer::allocate(c, budget)).collect(),
            row_count: 0,
        }
    }

    pub fn row_count(&self)   -> usize           { self.row_count }
    pub fn is_empty(&self)    -> bool            { self.row_count == 0 }
    pub fn num_columns(&self) -> usize           { self.columns.len() }
    pub fn columns(&self)     -> &[ColumnBuffer] { &self.columns }

    /// 本批可容纳的最大行数（各列行容量的最小值）
    pub fn capacity_rows(&self) -> usize {
        self.columns.iter().map(|c| c.row_capacity).min().unwrap_or(0)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnBuffer> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    /// 已使用字节数（数据 + offsets + validity）
    pub fn nbytes(&self) -> usize {
        self.columns.iter()
            .map(|c| {
                c.data_len
                    + c.offsets().map_or(0, |o| o.len() * 8)
                    + c.validity().map_or(0, <[u8]>::len)
            })
            .sum()
    }

    /// 重新提交前清空所有填充计数
    pub fn clear(&mut self) {
        self.columns.iter_mut().for_each(ColumnBuffer::clear);
        self.row_count = 0;
    }

    /// 重新分配一列的数据区，其余列不动
    pub fn grow(&mut self, column: &str, new_byte_size: usize) -> Result<()> {
        let col = self.columns.iter_mut()
            .find(|c| c.name() == column)
            .ok_or_else(|| SomaError::UnknownColumn(column.into()))?;
        col.grow(new_byte_size)
    }

    /// 上次写入失败的列：(列名, 需要的数据字节)
    pub fn shortfalls(&self) -> Vec<(String, usize)> {
        self.columns.iter()
            .filter_map(|c| c.shortfall.map(|n| (c.name().to_string(), n)))
            .collect()
    }

    /// 引擎侧写入：整行全部有空间才写，否则一字节不写并记录缺口
    pub fn try_push_row(&mut self, row: &[Value]) -> Result<bool> {
        if row.len() != self.columns.len() {
            return Err(SomaError::LengthMismatch { expected: self.columns.len(), actual: row.len() });
        }
        for (c, v) in self.columns.iter().zip(row) {
            c.check_value(v)?;
        }
        let mut fits = true;
        for (c, v) in self.columns.iter_mut().zip(row) {
            fits &= c.has_room(v);
        }
        if !fits {
            return Ok(false);
        }
        for (c, v) in self.columns.iter_mut().zip(row) {
            c.push(v);
        }
        self.row_count += 1;
        Ok(true)
    }

    /// 追加一行，空间不足时自动扩容（用于组装写入批次）
    pub fn append_row(&mut self, row: &[Value]) -> Result<()> {
        while !self.try_push_row(row)? {
            for (name, need) in self.shortfalls() {
                let cap = self.column(&name).map_or(0, ColumnBuffer::data_capacity);
                self.grow(&name, need.max(cap * 2))?;
            }
        }
        Ok(())
    }

    /// 解码单元格
    pub fn value(&self, column: usize, row: usize) -> Option<Value> {
        self.columns.get(column)?.value(row)
    }

    /// 解码一整行
    pub fn row(&self, row: usize) -> Option<Vec<Value>> {
        self.columns.iter().map(|c| c.value(row)).collect()
    }

    /// 本批已用字节的 CRC32，用于比较两次读取是否逐位一致
    pub fn checksum(&self) -> u32 {
        let mut h = crc32fast::Hasher::new();
        h.update(&(self.row_count as u64).to_le_bytes());
        for c in &self.columns {
            c.hash_into(&mut h);
        }
        h.finalize()
    }
}
