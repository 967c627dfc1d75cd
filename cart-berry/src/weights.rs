//! 分级模型与其二进制权重文件.
//!
//! 二进制文件全部为小端序, 依次为
//!
//! | 字段 | 类型 | 个数 |
//! |------|------|------|
//! | 特征维数 `w` | `i32` | 1 |
//! | 主成分数 `k` | `i32` | 1 |
//! | 主成分向量 | `f32` | `w × k`, 按特征逐个写出, 每个特征依次写出 `k` 个载荷 |
//! | 奇异值 | `f32` | `k` |
//! | 线性回归权重 | `f64` | `k` |
//! | 逻辑回归权重 | `f64` | `k` |
//! | 特征均值 | `f64` | `w` |
//! | 线性回归截距 | `f64` | 1 |
//! | 逻辑回归截距 | `f64` | 1 |

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::config::GradingConfig;
use crate::pca::Pca;
use crate::regression::{sigmoid, GradeTransform, Logistic, Model};
use crate::{GradingError, GradingResult};

/// 逻辑回归部分的正类阈值: 分级大于 `1` 视为退变.
pub const DEGENERATION_ABOVE: f64 = 1.0;

/// 逻辑回归部分的 Newton 迭代上限.
const LOGISTIC_MAX_ITER: usize = 1000;

/// 二进制权重文件的内容.
///
/// 线性与逻辑回归权重作用于 *未白化* 的主成分得分 `(x - mean) · eigenvectors`,
/// 白化的缩放已经折算进权重中.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryWeights {
    /// 主成分向量, `(特征, 主成分)`.
    pub eigenvectors: Array2<f64>,
    /// 奇异值.
    pub singular_values: Array1<f64>,
    /// 线性回归权重.
    pub linear_weights: Array1<f64>,
    /// 逻辑回归权重.
    pub logistic_weights: Array1<f64>,
    /// 特征均值.
    pub mean: Array1<f64>,
    /// 线性回归截距.
    pub linear_intercept: f64,
    /// 逻辑回归截距.
    pub logistic_intercept: f64,
}

impl BinaryWeights {
    /// 特征维数.
    #[inline]
    pub fn width(&self) -> usize {
        self.eigenvectors.nrows()
    }

    /// 主成分数.
    #[inline]
    pub fn n_components(&self) -> usize {
        self.eigenvectors.ncols()
    }

    /// 检查各字段长度是否与 `eigenvectors` 的形状一致.
    pub fn check(&self) -> GradingResult<()> {
        let (w, k) = self.eigenvectors.dim();
        let lens = [
            ("singular values", self.singular_values.len(), k),
            ("linear weights", self.linear_weights.len(), k),
            ("logistic weights", self.logistic_weights.len(), k),
            ("mean", self.mean.len(), w),
        ];
        for (name, got, want) in lens {
            if got != want {
                return Err(GradingError::ShapeMismatch(format!(
                    "{name} has length {got}, expected {want}"
                )));
            }
        }
        if i32::try_from(w).is_err() || i32::try_from(k).is_err() {
            return Err(GradingError::ShapeMismatch(format!(
                "{w} x {k} eigenvectors do not fit the i32 header"
            )));
        }
        Ok(())
    }

    /// 对每行一个样本的特征 `x` 预测 `(分级, 退变概率)`.
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<(Array1<f64>, Array1<f64>)> {
        if x.ncols() != self.width() {
            return Err(GradingError::ShapeMismatch(format!(
                "weights expect {} features, got {}",
                self.width(),
                x.ncols()
            )));
        }
        let scores = (&x - &self.mean).dot(&self.eigenvectors);
        let grades = scores.dot(&self.linear_weights) + self.linear_intercept;
        let probabilities =
            (scores.dot(&self.logistic_weights) + self.logistic_intercept).mapv(sigmoid);
        Ok((grades, probabilities))
    }
}

/// 写出二进制权重文件.
pub fn write_binary_weights<P: AsRef<Path>>(path: P, weights: &BinaryWeights) -> GradingResult<()> {
    weights.check()?;
    let (w, k) = weights.eigenvectors.dim();
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    // `check` 保证两者都能放进 i32.
    out.write_all(&(w as i32).to_le_bytes())?;
    out.write_all(&(k as i32).to_le_bytes())?;
    for row in weights.eigenvectors.rows() {
        for v in row {
            out.write_all(&(*v as f32).to_le_bytes())?;
        }
    }
    for v in &weights.singular_values {
        out.write_all(&(*v as f32).to_le_bytes())?;
    }
    for v in weights
        .linear_weights
        .iter()
        .chain(&weights.logistic_weights)
        .chain(&weights.mean)
        .chain([&weights.linear_intercept, &weights.logistic_intercept])
    {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// 按顺序读取小端数值.
struct LeReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> LeReader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let chunk = self.bytes.get(self.at..self.at + N)?;
        self.at += N;
        chunk.try_into().ok()
    }

    fn i32(&mut self) -> Option<i32> {
        self.take().map(i32::from_le_bytes)
    }

    fn f32s(&mut self, n: usize) -> Option<Vec<f64>> {
        (0..n)
            .map(|_| self.take().map(|b| f32::from_le_bytes(b) as f64))
            .collect()
    }

    fn f64s(&mut self, n: usize) -> Option<Vec<f64>> {
        (0..n).map(|_| self.take().map(f64::from_le_bytes)).collect()
    }
}

/// 读取二进制权重文件.
///
/// 头部为 `w × k` 时文件应有的字节数. 溢出时返回 `None`.
fn expected_len(w: usize, k: usize) -> Option<usize> {
    let eigenvectors = w.checked_mul(k)?.checked_mul(4)?;
    let f64s = k.checked_mul(2)?.checked_add(w)?.checked_add(2)?.checked_mul(8)?;
    8usize
        .checked_add(eigenvectors)?
        .checked_add(k.checked_mul(4)?)?
        .checked_add(f64s)
}

/// # 错误
///
/// 头部为负数, 头部描述的长度溢出, 或文件长度与头部描述不符时返回
/// [`GradingError::LoadFailure`].
pub fn load_binary_weights<P: AsRef<Path>>(path: P) -> GradingResult<BinaryWeights> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| GradingError::load_failure(path, e))?;
    let truncated = || GradingError::load_failure(path, "truncated weights file");
    let mut r = LeReader { bytes: &bytes, at: 0 };

    let (w, k) = match (r.i32().ok_or_else(truncated)?, r.i32().ok_or_else(truncated)?) {
        (w, k) if w >= 0 && k >= 0 => (w as usize, k as usize),
        (w, k) => {
            return Err(GradingError::load_failure(
                path,
                format!("negative header {w} x {k}"),
            ))
        }
    };
    let expected = expected_len(w, k).ok_or_else(|| {
        GradingError::load_failure(path, format!("header {w} x {k} overflows"))
    })?;
    if bytes.len() != expected {
        return Err(GradingError::load_failure(
            path,
            format!(
                "{} bytes for {w} features and {k} components, expected {expected}",
                bytes.len()
            ),
        ));
    }

    let eigenvectors = r.f32s(w * k).ok_or_else(truncated)?;
    let eigenvectors = Array2::from_shape_vec((w, k), eigenvectors)
        .map_err(|e| GradingError::load_failure(path, e))?;
    let singular_values = Array1::from(r.f32s(k).ok_or_else(truncated)?);
    let linear_weights = Array1::from(r.f64s(k).ok_or_else(truncated)?);
    let logistic_weights = Array1::from(r.f64s(k).ok_or_else(truncated)?);
    let mean = Array1::from(r.f64s(w).ok_or_else(truncated)?);
    let tail = r.f64s(2).ok_or_else(truncated)?;

    Ok(BinaryWeights {
        eigenvectors,
        singular_values,
        linear_weights,
        logistic_weights,
        mean,
        linear_intercept: tail[0],
        logistic_intercept: tail[1],
    })
}

/// 在全部样本上训练的分级模型: PCA, 线性回归分级, 以及逻辑回归判断退变.
pub struct GradingModel {
    pca: Pca,
    linear: Box<dyn Model>,
    logistic: Logistic,
}

impl GradingModel {
    /// 在每行一个样本的特征 `features` 与分级 `grades` 上拟合.
    ///
    /// 线性部分使用 `config.regression.model`, 必须是回归模型;
    /// 二进制权重无法表达分级变换, 所以 `config.regression.transform` 必须为
    /// [`GradeTransform::None`].
    pub fn fit(
        features: ArrayView2<'_, f64>,
        grades: ArrayView1<'_, f64>,
        config: &GradingConfig,
    ) -> GradingResult<Self> {
        let kind = &config.regression.model;
        if kind.is_classifier() {
            return Err(GradingError::UnsupportedMethod(format!(
                "{} as the linear part of a grading model",
                kind.name()
            )));
        }
        if config.regression.transform != GradeTransform::None {
            return Err(GradingError::UnsupportedMethod(format!(
                "{:?} grade transform in binary weights",
                config.regression.transform
            )));
        }
        let features_cfg = &config.features;
        let (pca, scores) =
            Pca::fit_transform(features, features_cfg.n_components, features_cfg.whiten)?;

        let mut linear = kind.build();
        linear.fit(scores.view(), grades)?;
        let mut logistic = Logistic::new(1.0, false, DEGENERATION_ABOVE, LOGISTIC_MAX_ITER);
        logistic.fit(scores.view(), grades)?;
        info!(
            "grading model on {} samples, {} features, {} components",
            features.nrows(),
            features.ncols(),
            pca.n_components()
        );
        Ok(Self {
            pca,
            linear,
            logistic,
        })
    }

    /// 拟合得到的 PCA.
    #[inline]
    pub fn pca(&self) -> &Pca {
        &self.pca
    }

    /// 预测 `(分级, 退变概率)`.
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<(Array1<f64>, Array1<f64>)> {
        let scores = self.pca.transform(x)?;
        Ok((
            self.linear.predict(scores.view())?,
            self.logistic.predict(scores.view())?,
        ))
    }

    /// 转换为二进制权重.
    pub fn to_binary(&self) -> BinaryWeights {
        let scale = if self.pca.whiten() {
            self.pca.scale()
        } else {
            Array1::ones(self.pca.n_components())
        };
        BinaryWeights {
            eigenvectors: self.pca.components().t().to_owned(),
            singular_values: self.pca.singular_values().to_owned(),
            linear_weights: &self.linear.coefficients() / &scale,
            logistic_weights: &self.logistic.coefficients() / &scale,
            mean: self.pca.mean().to_owned(),
            linear_intercept: self.linear.intercept(),
            logistic_intercept: self.logistic.intercept(),
        }
    }
}
