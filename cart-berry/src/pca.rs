//! 特征矩阵与 (白化) 主成分分析.
//!
//! PCA 通过中心化矩阵的薄 SVD 计算, 与 `X = U S Vᵀ` 对应:
//! 主成分是 `Vᵀ` 的行, 解释方差为 `s² / (n - 1)`.
//! 奇异向量的符号按照 `U` 每列绝对值最大元素为正来固定, 因此结果是确定的.

use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{JobSvd, SVDDC};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{GradingError, GradingResult};

/// 解释方差小于该值的主成分, 白化时不做缩放.
const WHITEN_EPS: f64 = 1e-12;

/// 主成分数目.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(untagged))]
pub enum NComponents {
    /// 固定数目.
    Count(usize),
    /// 累计解释方差比例超过该值的最少主成分数, 取值于 `(0, 1)`.
    Variance(f64),
}

impl NComponents {
    /// 按解释方差比例确定主成分数目. `ratios` 按降序排列, 长度即最大可用秩.
    pub fn resolve(&self, ratios: ArrayView1<'_, f64>) -> GradingResult<usize> {
        let max = ratios.len();
        match *self {
            NComponents::Count(k) if k == 0 || k > max => Err(GradingError::ShapeMismatch(
                format!("{k} components requested, at most {max} available"),
            )),
            NComponents::Count(k) => Ok(k),
            NComponents::Variance(f) if !(f > 0.0 && f < 1.0) => Err(
                GradingError::UnsupportedMethod(format!("explained variance fraction {f}")),
            ),
            NComponents::Variance(f) => {
                let mut acc = 0.0;
                for (i, r) in ratios.iter().enumerate() {
                    acc += r;
                    if acc > f {
                        return Ok(i + 1);
                    }
                }
                Ok(max)
            }
        }
    }
}

/// PCA 的拟合范围.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum FeatureFit {
    /// 在全部样本上拟合一次.
    ///
    /// 交叉验证只保证各折回归模型互不可见, PCA 本身看到了测试样本,
    /// 用于评估时结果应视为乐观估计.
    Global,
    /// 在每折训练集上单独拟合, 测试样本不参与.
    #[default]
    PerFold,
}

/// 拟合好的 PCA.
#[derive(Clone, Debug, PartialEq)]
pub struct Pca {
    mean: Array1<f64>,
    components: Array2<f64>,
    singular_values: Array1<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
    whiten: bool,
}

impl Pca {
    /// 在 `x` (每行一个样本) 上拟合.
    ///
    /// # 错误
    ///
    /// 样本数少于 2, 或主成分数目不合法时返回错误.
    pub fn fit(x: ArrayView2<'_, f64>, n: NComponents, whiten: bool) -> GradingResult<Self> {
        let (rows, cols) = x.dim();
        if rows < 2 || cols == 0 {
            return Err(GradingError::ShapeMismatch(format!(
                "cannot fit pca on a {rows}x{cols} matrix"
            )));
        }
        let mean = x.mean_axis(Axis(0)).ok_or_else(|| {
            GradingError::ShapeMismatch("empty feature matrix".to_owned())
        })?;
        let centered = &x - &mean;
        let (u, s, vt) = centered.svddc(JobSvd::Some)?;
        let (Some(mut u), Some(mut vt)) = (u, vt) else {
            return Err(GradingError::ShapeMismatch("svd returned no singular vectors".to_owned()));
        };
        svd_flip(&mut u, &mut vt);

        let variance = s.mapv(|v| v * v / (rows - 1) as f64);
        let total = variance.sum();
        let ratio = if total > 0.0 {
            &variance / total
        } else {
            Array1::zeros(variance.len())
        };
        let k = n.resolve(ratio.view())?;
        debug!(
            "pca on {rows}x{cols}: {k} components explain {:.3} of variance",
            ratio.slice(s![..k]).sum()
        );

        Ok(Self {
            mean,
            components: vt.slice(s![..k, ..]).to_owned(),
            singular_values: s.slice(s![..k]).to_owned(),
            explained_variance: variance.slice(s![..k]).to_owned(),
            explained_variance_ratio: ratio.slice(s![..k]).to_owned(),
            whiten,
        })
    }

    /// 拟合并返回训练集上的得分.
    pub fn fit_transform(
        x: ArrayView2<'_, f64>,
        n: NComponents,
        whiten: bool,
    ) -> GradingResult<(Self, Array2<f64>)> {
        let pca = Self::fit(x, n, whiten)?;
        let scores = pca.transform(x)?;
        Ok((pca, scores))
    }

    /// 主成分个数.
    #[inline]
    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// 主成分, 形状 `(n_components, n_features)`.
    #[inline]
    pub fn components(&self) -> ArrayView2<'_, f64> {
        self.components.view()
    }

    /// 奇异值.
    #[inline]
    pub fn singular_values(&self) -> ArrayView1<'_, f64> {
        self.singular_values.view()
    }

    /// 各主成分的解释方差.
    #[inline]
    pub fn explained_variance(&self) -> ArrayView1<'_, f64> {
        self.explained_variance.view()
    }

    /// 各主成分的解释方差比例.
    #[inline]
    pub fn explained_variance_ratio(&self) -> ArrayView1<'_, f64> {
        self.explained_variance_ratio.view()
    }

    /// 训练集特征均值.
    #[inline]
    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    /// 是否白化?
    #[inline]
    pub fn whiten(&self) -> bool {
        self.whiten
    }

    /// 白化时各主成分得分的缩放因子.
    pub(crate) fn scale(&self) -> Array1<f64> {
        self.explained_variance
            .mapv(|v| if v > WHITEN_EPS { v.sqrt() } else { 1.0 })
    }

    /// 投影到主成分空间.
    pub fn transform(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(GradingError::ShapeMismatch(format!(
                "pca fitted on {} features, got {}",
                self.mean.len(),
                x.ncols()
            )));
        }
        let mut scores = (&x - &self.mean).dot(&self.components.t());
        if self.whiten {
            scores /= &self.scale();
        }
        Ok(scores)
    }

    /// 由主成分得分重建特征.
    pub fn inverse_transform(&self, scores: ArrayView2<'_, f64>) -> GradingResult<Array2<f64>> {
        if scores.ncols() != self.n_components() {
            return Err(GradingError::ShapeMismatch(format!(
                "pca has {} components, got {}",
                self.n_components(),
                scores.ncols()
            )));
        }
        let scores = if self.whiten {
            &scores * &self.scale()
        } else {
            scores.to_owned()
        };
        Ok(scores.dot(&self.components) + &self.mean)
    }
}

/// 固定奇异向量的符号: `U` 每列绝对值最大的元素为正.
fn svd_flip(u: &mut Array2<f64>, vt: &mut Array2<f64>) {
    let k = u.ncols().min(vt.nrows());
    for j in 0..k {
        let col = u.column(j);
        let pivot = col
            .iter()
            .copied()
            .fold(0.0f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            u.column_mut(j).mapv_inplace(|v| -v);
            vt.row_mut(j).mapv_inplace(|v| -v);
        }
    }
}

/// 二维图像的中心裁剪: 每个方向上长度超过 `max` 时, 保留居中的 `max` 个元素.
pub fn center_crop(image: ArrayView2<'_, f64>, max: usize) -> ArrayView2<'_, f64> {
    let (h, w) = image.dim();
    let (h0, w0) = (h.saturating_sub(max) / 2, w.saturating_sub(max) / 2);
    image.slice_move(s![h0..h0 + h.min(max), w0..w0 + w.min(max)])
}

/// 由各样本的特征图像构造特征矩阵, 每行是一幅图像按行展开的结果.
///
/// `max_roi` 给定时先做中心裁剪. 裁剪后尺寸不一致时返回
/// [`GradingError::ShapeMismatch`].
pub fn feature_matrix<'a, I>(images: I, max_roi: Option<usize>) -> GradingResult<Array2<f64>>
where
    I: IntoIterator<Item = ArrayView2<'a, f64>>,
{
    let mut rows: Vec<Array1<f64>> = Vec::new();
    let mut shape = None;
    for (i, image) in images.into_iter().enumerate() {
        let image = match max_roi {
            Some(m) => center_crop(image, m),
            None => image,
        };
        match shape {
            None => shape = Some(image.dim()),
            Some(d) if d != image.dim() => {
                return Err(GradingError::ShapeMismatch(format!(
                    "feature image {i} is {:?}, expected {d:?}",
                    image.dim()
                )))
            }
            _ => {}
        }
        rows.push(image.iter().copied().collect());
    }
    let width = rows.first().map_or(0, |r| r.len());
    let mut x = Array2::zeros((rows.len(), width));
    for (mut dst, src) in x.outer_iter_mut().zip(&rows) {
        dst.assign(src);
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn data() -> Array2<f64> {
        array![
            [2.5, 2.4, 0.5, 1.0],
            [0.5, 0.7, 1.5, 2.0],
            [2.2, 2.9, 0.1, 0.3],
            [1.9, 2.2, 0.9, 1.1],
            [3.1, 3.0, 2.2, 0.4],
            [2.3, 2.7, 1.3, 1.7],
            [2.0, 1.6, 0.4, 0.2],
        ]
    }

    #[test]
    fn test_resolve() {
        let ratios = array![0.6, 0.25, 0.1, 0.05];
        assert_eq!(NComponents::Variance(0.5).resolve(ratios.view()).unwrap(), 1);
        assert_eq!(NComponents::Variance(0.6).resolve(ratios.view()).unwrap(), 2);
        assert_eq!(NComponents::Variance(0.9).resolve(ratios.view()).unwrap(), 3);
        assert_eq!(NComponents::Count(4).resolve(ratios.view()).unwrap(), 4);
        assert!(NComponents::Count(5).resolve(ratios.view()).is_err());
        assert!(NComponents::Variance(1.5).resolve(ratios.view()).is_err());
    }

    #[test]
    fn test_full_rank_round_trip() {
        let x = data();
        for whiten in [false, true] {
            let (pca, scores) = Pca::fit_transform(x.view(), NComponents::Count(4), whiten).unwrap();
            let back = pca.inverse_transform(scores.view()).unwrap();
            for (a, b) in back.iter().zip(x.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_whitened_scores_have_unit_variance() {
        let x = data();
        let (pca, scores) = Pca::fit_transform(x.view(), NComponents::Count(2), true).unwrap();
        assert_eq!(scores.dim(), (7, 2));
        for col in scores.columns() {
            assert_abs_diff_eq!(col.mean().unwrap(), 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(col.var(1.0), 1.0, epsilon = 1e-9);
        }
        let ratio = pca.explained_variance_ratio();
        assert!(ratio[0] >= ratio[1]);
    }

    #[test]
    fn test_variance_fraction_and_errors() {
        let x = data();
        let pca = Pca::fit(x.view(), NComponents::Variance(0.999_999), false).unwrap();
        assert!(pca.explained_variance_ratio().sum() > 0.999_999);
        assert!(Pca::fit(x.slice(s![..1, ..]), NComponents::Count(1), false).is_err());
        assert!(pca.transform(Array2::zeros((2, 3)).view()).is_err());
    }

    #[test]
    fn test_feature_matrix() {
        let a = Array2::from_shape_fn((6, 6), |(i, j)| (i * 6 + j) as f64);
        let b = Array2::<f64>::ones((6, 6));
        let x = feature_matrix([a.view(), b.view()], Some(4)).unwrap();
        assert_eq!(x.dim(), (2, 16));
        // 中心裁剪从 (1, 1) 开始.
        assert_abs_diff_eq!(x[(0, 0)], 7.0);
        let c = Array2::<f64>::zeros((3, 3));
        assert!(feature_matrix([a.view(), c.view()], Some(4)).is_err());
        assert_eq!(feature_matrix([a.view()], None).unwrap().ncols(), 36);
    }
}
