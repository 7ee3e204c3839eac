//! 数组 Schema：维度列 + 属性列

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::common::{Coord, Result, SomaError};
use crate::field_type::ColumnType;

// ── 列定义 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name:         String,
    pub column_type:  ColumnType,
    pub is_dimension: bool,
    pub is_nullable:  bool,
    /// 维度的 [lo, hi] 定义域
    pub domain:       Option<(Coord, Coord)>,
    /// 分类列的取值表（code → 字符串）
    pub enumeration:  Vec<String>,
}

impl ColumnSchema {
    /// 构建维度列（SOMA 维度不可为空）
    pub fn dim(name: &str, column_type: ColumnType, domain: (Coord, Coord)) -> Self {
        Self {
            name: name.into(), column_type,
            is_dimension: true, is_nullable: false,
            domain: Some(domain), enumeration: vec![],
        }
    }
    /// 构建属性列
    pub fn attr(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.into(), column_type,
            is_dimension: false, is_nullable: false,
            domain: None, enumeration: vec![],
        }
    }
    /// 构建分类属性列
    pub fn categorical(name: &str, values: &[&str]) -> Self {
        Self {
            enumeration: values.iter().map(|s| s.to_string()).collect(),
            ..Self::attr(name, ColumnType::Categorical)
        }
    }
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true; self
    }
}

// ── Array Schema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    pub columns: Vec<ColumnSchema>,
}

impl ArraySchema {
    pub fn new(columns: Vec<ColumnSchema>) -> Result<Self> {
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return Err(SomaError::SchemaMismatch(format!("duplicate column {}", c.name)));
            }
            if c.is_dimension && c.is_nullable {
                return Err(SomaError::SchemaMismatch(format!("nullable dimension {}", c.name)));
            }
            if c.column_type == ColumnType::Categorical && c.enumeration.is_empty() {
                return Err(SomaError::SchemaMismatch(format!("empty enumeration {}", c.name)));
            }
        }
        if !columns.iter().any(|c| c.is_dimension) {
            return Err(SomaError::SchemaMismatch("array has no dimensions".into()));
        }
        Ok(Self { columns })
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_dimension)
    }
    pub fn attributes(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| !c.is_dimension)
    }
    pub fn ndim(&self) -> usize { self.dimensions().count() }
    pub fn num_columns(&self) -> usize { self.columns.len() }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// 列投影：空列表表示全部列，按请求顺序返回；同一列不能请求两次
    pub fn project(&self, names: &[String]) -> Result<Vec<ColumnSchema>> {
        if names.is_empty() {
            return Ok(self.columns.clone());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(SomaError::SchemaMismatch(format!("duplicate column {dup} in projection")));
        }
        names.iter()
            .map(|n| self.column(n).cloned().ok_or_else(|| SomaError::UnknownColumn(n.clone())))
            .collect()
    }

    /// 校验一个可用于选择的维度名
    pub fn selectable_dim(&self, name: &str) -> Result<&ColumnSchema> {
        let col = self.column(name).ok_or_else(|| SomaError::UnknownColumn(name.into()))?;
        if !col.is_dimension {
            return Err(SomaError::NotADimension(name.into()));
        }
        if !col.column_type.is_integer() {
            return Err(SomaError::Unsupported(format!(
                "selection on {} dimension {}", col.column_type.type_name(), name,
            )));
        }
        Ok(col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> ArraySchema {
        ArraySchema::new(vec![
            ColumnSchema::dim("soma_dim_0", ColumnType::Int64, (0, 99)),
            ColumnSchema::dim("soma_dim_1", ColumnType::Int64, (0, 49)),
            ColumnSchema::attr("soma_data", ColumnType::Float32),
        ]).unwrap()
    }

    #[test]
    fn projection_keeps_request_order() {
        let s = matrix();
        let cols = s.project(&["soma_data".into(), "soma_dim_0".into()]).unwrap();
        assert_eq!(cols[0].name, "soma_data");
        assert_eq!(cols[1].name, "soma_dim_0");
        assert_eq!(s.project(&[]).unwrap().len(), 3);
        assert!(matches!(s.project(&["nope".into()]), Err(SomaError::UnknownColumn(_))));
    }

    #[test]
    fn projection_rejects_repeated_names() {
        let s = matrix();
        assert!(matches!(
            s.project(&["soma_data".into(), "soma_dim_0".into(), "soma_data".into()]),
            Err(SomaError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn attribute_is_not_selectable() {
        let s = matrix();
        assert!(s.selectable_dim("soma_dim_1").is_ok());
        assert!(matches!(s.selectable_dim("soma_data"), Err(SomaError::NotADimension(_))));
    }

    #[test]
    fn rejects_bad_schemas() {
        assert!(ArraySchema::new(vec![ColumnSchema::attr("a", ColumnType::Int8)]).is_err());
        assert!(ArraySchema::new(vec![
            ColumnSchema::dim("d", ColumnType::Int64, (0, 1)),
            ColumnSchema::attr("d", ColumnType::Int8),
        ]).is_err());
    }
}
