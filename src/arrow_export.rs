//! BufferSet → Arrow
//!
//! | 列类型            | Arrow 类型                     |
//! |-------------------|--------------------------------|
//! | 整数 / 浮点       | 对应 primitive                 |
//! | Bool              | Boolean（位图）                |
//! | Utf8 / Binary     | LargeUtf8 / LargeBinary        |
//! | Timestamp(unit)   | Timestamp(unit, None)          |
//! | Categorical       | Dictionary(Int32, Utf8)        |
//!
//! 每行 1 字节的有效位转换为 Arrow null 位图。导出的 C Data Interface
//! 结构体由 [`ExportedBatch`] 独占，release 回调沿用 arrow 自带实现。

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, ArrowPrimitiveType, BooleanArray, DictionaryArray, LargeBinaryArray,
    LargeStringArray, PrimitiveArray, StringArray, StructArray,
};
use arrow::buffer::{Buffer, NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{
    Field, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, Schema,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::ffi::{from_ffi, to_ffi, FFI_ArrowArray, FFI_ArrowSchema};
use arrow::record_batch::RecordBatch;
use byteorder::{ByteOrder, LittleEndian};

use crate::buffers::{BufferSet, ColumnBuffer};
use crate::common::{Result, SomaError};
use crate::field_type::{ColumnType, TimeUnit};
use crate::schema::ArraySchema;

// ── RecordBatch ───────────────────────────────────────────────────────────────

/// 把一批结果转换为 RecordBatch，列顺序与 BufferSet 相同
pub fn to_record_batch(buffers: &BufferSet, schema: &ArraySchema) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(buffers.num_columns());
    let mut arrays = Vec::with_capacity(buffers.num_columns());
    for col in buffers.columns() {
        let declared = schema.column(col.name())
            .ok_or_else(|| SomaError::UnknownColumn(col.name().into()))?;
        if declared.column_type != col.column_type() {
            return Err(SomaError::SchemaMismatch(format!(
                "buffer {} is {}, schema says {}",
                col.name(), col.column_type().type_name(), declared.column_type.type_name(),
            )));
        }
        let array = column_array(col, &declared.enumeration)?;
        fields.push(Field::new(col.name(), array.data_type().clone(), declared.is_nullable));
        arrays.push(array);
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn null_buffer(col: &ColumnBuffer) -> Option<NullBuffer> {
    col.validity().map(|v| NullBuffer::from(v.iter().map(|&b| b != 0).collect::<Vec<bool>>()))
}

fn primitive<T: ArrowPrimitiveType>(
    col:    &ColumnBuffer,
    decode: fn(&[u8]) -> T::Native,
) -> Result<ArrayRef> {
    let width  = std::mem::size_of::<T::Native>();
    let values: Vec<T::Native> = col.data().chunks_exact(width).map(decode).collect();
    Ok(Arc::new(PrimitiveArray::<T>::try_new(ScalarBuffer::from(values), null_buffer(col))?))
}

fn large_offsets(col: &ColumnBuffer) -> OffsetBuffer<i64> {
    let offsets: Vec<i64> = col.offsets()
        .map_or_else(|| vec![0], |o| o.iter().map(|&x| x as i64).collect());
    OffsetBuffer::new(ScalarBuffer::from(offsets))
}

fn column_array(col: &ColumnBuffer, enumeration: &[String]) -> Result<ArrayRef> {
    Ok(match col.column_type() {
        ColumnType::Int8    => primitive::<Int8Type>(col, |b| b[0] as i8)?,
        ColumnType::UInt8   => primitive::<UInt8Type>(col, |b| b[0])?,
        ColumnType::Int16   => primitive::<Int16Type>(col, LittleEndian::read_i16)?,
        ColumnType::UInt16  => primitive::<UInt16Type>(col, LittleEndian::read_u16)?,
        ColumnType::Int32   => primitive::<Int32Type>(col, LittleEndian::read_i32)?,
        ColumnType::UInt32  => primitive::<UInt32Type>(col, LittleEndian::read_u32)?,
        ColumnType::Int64   => primitive::<Int64Type>(col, LittleEndian::read_i64)?,
        ColumnType::UInt64  => primitive::<UInt64Type>(col, LittleEndian::read_u64)?,
        ColumnType::Float32 => primitive::<Float32Type>(col, LittleEndian::read_f32)?,
        ColumnType::Float64 => primitive::<Float64Type>(col, LittleEndian::read_f64)?,
        ColumnType::Timestamp(unit) => match unit {
            TimeUnit::Second      => primitive::<TimestampSecondType>(col, LittleEndian::read_i64)?,
            TimeUnit::Millisecond => primitive::<TimestampMillisecondType>(col, LittleEndian::read_i64)?,
            TimeUnit::Microsecond => primitive::<TimestampMicrosecondType>(col, LittleEndian::read_i64)?,
            TimeUnit::Nanosecond  => primitive::<TimestampNanosecondType>(col, LittleEndian::read_i64)?,
        },
        ColumnType::Bool => {
            let values: Vec<Option<bool>> = (0..col.rows())
                .map(|r| col.is_valid(r).then(|| col.data()[r] != 0))
                .collect();
            Arc::new(BooleanArray::from(values))
        }
        ColumnType::Utf8 => Arc::new(LargeStringArray::try_new(
            large_offsets(col), Buffer::from(col.data().to_vec()), null_buffer(col),
        )?),
        ColumnType::Binary => Arc::new(LargeBinaryArray::try_new(
            large_offsets(col), Buffer::from(col.data().to_vec()), null_buffer(col),
        )?),
        ColumnType::Categorical => {
            let codes: Vec<i32> = col.data().chunks_exact(4).map(LittleEndian::read_i32).collect();
            let keys   = PrimitiveArray::<Int32Type>::try_new(ScalarBuffer::from(codes), null_buffer(col))?;
            let values = StringArray::from_iter_values(enumeration.iter());
            Arc::new(DictionaryArray::<Int32Type>::try_new(keys, Arc::new(values))?)
        }
    })
}

// ── C Data Interface ──────────────────────────────────────────────────────────

/// 以 struct 数组形式导出的一批结果
///
/// 持有 `FFI_ArrowArray` / `FFI_ArrowSchema`；drop 时若消费者尚未 release，
/// 由 arrow 的 release 回调释放，不会重复释放。
#[derive(Debug)]
pub struct ExportedBatch {
    array:  FFI_ArrowArray,
    schema: FFI_ArrowSchema,
}

pub fn export_ffi(buffers: &BufferSet, schema: &ArraySchema) -> Result<ExportedBatch> {
    let batch = to_record_batch(buffers, schema)?;
    let data  = StructArray::from(batch).to_data();
    let (array, schema) = to_ffi(&data)?;
    Ok(ExportedBatch { array, schema })
}

impl ExportedBatch {
    pub fn len(&self)      -> usize { self.array.len() }
    pub fn is_empty(&self) -> bool  { self.array.is_empty() }

    pub fn array(&self)  -> &FFI_ArrowArray  { &self.array }
    pub fn schema(&self) -> &FFI_ArrowSchema { &self.schema }

    /// 把所有权交给 C 消费者；消费者负责调用两个 release 回调
    /// 并最终通过 [`ExportedBatch::from_raw`] 归还外层内存
    pub fn into_raw(self) -> (*mut FFI_ArrowArray, *mut FFI_ArrowSchema) {
        (Box::into_raw(Box::new(self.array)), Box::into_raw(Box::new(self.schema)))
    }

    /// # Safety
    ///
    /// 两个指针必须来自同一次 [`ExportedBatch::into_raw`]，且只能归还一次。
    pub unsafe fn from_raw(array: *mut FFI_ArrowArray, schema: *mut FFI_ArrowSchema) -> Self {
        Self { array: *Box::from_raw(array), schema: *Box::from_raw(schema) }
    }

    /// 从 C Data Interface 重新导入为 RecordBatch
    pub fn import(self) -> Result<RecordBatch> {
        // SAFETY: 两个结构体都由 to_ffi 生成且从未被 release
        let data = unsafe { from_ffi(self.array, &self.schema)? };
        Ok(RecordBatch::from(StructArray::from(data)))
    }
}
