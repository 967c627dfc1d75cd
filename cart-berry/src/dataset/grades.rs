//! 组织病理学分级表.
//!
//! 表格为 CSV, 第一列是样本名, 其余各列是带名称的分级 (或分组) 数值.
//! 空单元格读作 `NaN`.

use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{GradingError, GradingResult};

/// 多列分级的聚合方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Aggregate {
    /// 求和.
    #[default]
    Sum,
    /// 求平均.
    Mean,
}

impl FromStr for Aggregate {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            other => Err(GradingError::UnsupportedMethod(format!(
                "grade aggregation `{other}`"
            ))),
        }
    }
}

/// 分级表.
#[derive(Clone, Debug, PartialEq)]
pub struct GradeTable {
    ids: Vec<String>,
    columns: Vec<String>,
    values: Array2<f64>,
}

impl GradeTable {
    /// 从 CSV 文件读取.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> GradingResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| GradingError::load_failure(path, e))?;
        Self::from_reader(file).map_err(|e| match e {
            GradingError::Csv(e) => GradingError::load_failure(path, e),
            e => e,
        })
    }

    /// 从任意 CSV 数据源读取.
    pub fn from_reader<R: Read>(reader: R) -> GradingResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let columns: Vec<String> = rdr.headers()?.iter().skip(1).map(str::to_owned).collect();

        let mut ids = Vec::new();
        let mut flat = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut cells = record.iter();
            let id = cells.next().unwrap_or_default().to_owned();
            for (k, cell) in cells.enumerate() {
                let v = if cell.is_empty() {
                    f64::NAN
                } else {
                    cell.parse::<f64>().map_err(|e| {
                        GradingError::ShapeMismatch(format!(
                            "sample `{id}`, column `{}`: `{cell}` is not a number ({e})",
                            columns[k]
                        ))
                    })?
                };
                flat.push(v);
            }
            ids.push(id);
        }
        let values = Array2::from_shape_vec((ids.len(), columns.len()), flat)
            .map_err(|e| GradingError::ShapeMismatch(e.to_string()))?;
        debug!("grade table with {} samples, columns {:?}", ids.len(), columns);
        Ok(Self {
            ids,
            columns,
            values,
        })
    }

    /// 样本名.
    #[inline]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// 分级列名.
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// 样本数.
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// 是否没有任何样本?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 获取名为 `key` 的一列.
    pub fn column(&self, key: &str) -> GradingResult<ArrayView1<'_, f64>> {
        let k = self
            .columns
            .iter()
            .position(|c| c == key)
            .ok_or_else(|| GradingError::UnsupportedMethod(format!("no grade column `{key}`")))?;
        Ok(self.values.index_axis(Axis(1), k))
    }

    /// 选取若干列并按 `how` 聚合为一个分级向量.
    pub fn select(&self, keys: &[&str], how: Aggregate) -> GradingResult<Array1<f64>> {
        if keys.is_empty() {
            return Err(GradingError::ShapeMismatch("no grade column selected".to_owned()));
        }
        let mut out = Array1::zeros(self.len());
        for key in keys {
            out += &self.column(key)?;
        }
        if how == Aggregate::Mean {
            out /= keys.len() as f64;
        }
        Ok(out)
    }

    /// 将名为 `key` 的一列读作整数分组.
    pub fn groups(&self, key: &str) -> GradingResult<Vec<i64>> {
        self.column(key)?
            .iter()
            .zip(&self.ids)
            .map(|(v, id)| {
                if v.is_finite() && v.fract() == 0.0 {
                    Ok(*v as i64)
                } else {
                    Err(GradingError::ShapeMismatch(format!(
                        "group of sample `{id}` is not an integer: {v}"
                    )))
                }
            })
            .collect()
    }

    /// 按 `ids` 的顺序重排各行, 得到与样本列表一一对应的新表.
    pub fn for_samples<S: AsRef<str>>(&self, ids: &[S]) -> GradingResult<Self> {
        let rows = ids
            .iter()
            .map(|id| {
                let id = id.as_ref();
                self.ids.iter().position(|x| x == id).ok_or_else(|| {
                    GradingError::ShapeMismatch(format!("sample `{id}` has no grades"))
                })
            })
            .collect::<GradingResult<Vec<_>>>()?;
        Ok(Self {
            ids: rows.iter().map(|r| self.ids[*r].clone()).collect(),
            columns: self.columns.clone(),
            values: self.values.select(Axis(0), &rows),
        })
    }
}

/// 将每个元素连续重复 `n` 次, 用于子体积展开后的标签对齐.
pub fn duplicate_vector<T: Clone>(v: &[T], n: usize) -> Vec<T> {
    v.iter()
        .flat_map(|x| std::iter::repeat(x.clone()).take(n))
        .collect()
}
