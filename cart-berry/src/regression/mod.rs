//! 回归与分类模型, 以及基于它们的交叉验证.
//!
//! 所有模型都由 [`ModelKind`] 描述, 每个变体携带自己的超参数,
//! 通过 [`ModelKind::build`] 得到统一的 [`Model`] 接口.
//!
//! | 模型 | 输出 | 系数 |
//! |------|------|------|
//! | ridge / lasso / linear | 分级预测值 | 线性权重 |
//! | logistic | 正类概率 | 线性权重 |
//! | random forest | 正类概率 | 特征重要性, 截距恒为 `0` |

use std::str::FromStr;

use log::warn;
use ndarray::{Array1, ArrayView1, ArrayView2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_SEED;
use crate::{GradingError, GradingResult};

pub mod cv;
mod forest;
mod linear;
mod logistic;
pub mod metrics;

pub use cv::{cross_validate, regress_split, CvOutcome, Fold, FoldStats, Split, SplitOutcome};
pub use forest::RandomForest;
pub use linear::{Lasso, Linear, Ridge};
pub use logistic::Logistic;
pub(crate) use logistic::sigmoid;

/// 统一的模型接口.
pub trait Model {
    /// 在 `x` (每行一个样本) 和 `y` 上拟合.
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()>;

    /// 预测. 分类模型返回正类概率.
    fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array1<f64>>;

    /// 线性系数, 或随机森林的特征重要性. 拟合前为空.
    fn coefficients(&self) -> ArrayView1<'_, f64>;

    /// 截距.
    fn intercept(&self) -> f64;
}

/// 检查 `x` 与 `y` 样本数一致且非空.
pub(crate) fn check_xy(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()> {
    if x.nrows() != y.len() {
        return Err(GradingError::ShapeMismatch(format!(
            "{} feature rows but {} grades",
            x.nrows(),
            y.len()
        )));
    }
    if x.nrows() == 0 {
        return Err(GradingError::ShapeMismatch("no training samples".to_owned()));
    }
    Ok(())
}

/// 检查预测输入的特征数.
pub(crate) fn check_width(x: ArrayView2<'_, f64>, fitted: usize) -> GradingResult<()> {
    if x.ncols() != fitted {
        return Err(GradingError::ShapeMismatch(format!(
            "model fitted on {fitted} features, got {}",
            x.ncols()
        )));
    }
    Ok(())
}

#[cfg(feature = "serde")]
const fn yes() -> bool {
    true
}

#[cfg(feature = "serde")]
const fn default_alpha() -> f64 {
    1.0
}

#[cfg(feature = "serde")]
const fn default_c() -> f64 {
    1.0
}

#[cfg(feature = "serde")]
const fn default_positive_above() -> f64 {
    1.0
}

#[cfg(feature = "serde")]
const fn default_max_iter() -> usize {
    1000
}

#[cfg(feature = "serde")]
const fn default_trees() -> usize {
    400
}

#[cfg(feature = "serde")]
const fn default_depth() -> Option<usize> {
    Some(3)
}

#[cfg(feature = "serde")]
const fn default_seed() -> u64 {
    DEFAULT_SEED
}

/// 模型种类及其超参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum ModelKind {
    /// L2 正则化线性回归.
    Ridge {
        /// 正则化强度.
        #[cfg_attr(feature = "serde", serde(default = "default_alpha"))]
        alpha: f64,
        /// 是否拟合截距.
        #[cfg_attr(feature = "serde", serde(default = "yes"))]
        fit_intercept: bool,
        /// 拟合前是否将 (中心化后的) 各列缩放为单位 L2 范数. 不拟合截距时忽略.
        #[cfg_attr(feature = "serde", serde(default = "yes"))]
        normalize: bool,
    },
    /// L1 正则化线性回归.
    Lasso {
        /// 正则化强度.
        #[cfg_attr(feature = "serde", serde(default = "default_alpha"))]
        alpha: f64,
        /// 是否拟合截距.
        #[cfg_attr(feature = "serde", serde(default = "yes"))]
        fit_intercept: bool,
        /// 拟合前是否将 (中心化后的) 各列缩放为单位 L2 范数. 不拟合截距时忽略.
        #[cfg_attr(feature = "serde", serde(default = "yes"))]
        normalize: bool,
    },
    /// 普通最小二乘.
    Linear {
        /// 是否拟合截距.
        #[cfg_attr(feature = "serde", serde(default = "yes"))]
        fit_intercept: bool,
    },
    /// L2 正则化逻辑回归, 分级大于 `positive_above` 的样本为正类.
    Logistic {
        /// 正则化强度的倒数.
        #[cfg_attr(feature = "serde", serde(default = "default_c"))]
        c: f64,
        /// 是否拟合截距.
        #[cfg_attr(feature = "serde", serde(default))]
        fit_intercept: bool,
        /// 正类阈值.
        #[cfg_attr(feature = "serde", serde(default = "default_positive_above"))]
        positive_above: f64,
        /// Newton 迭代上限.
        #[cfg_attr(feature = "serde", serde(default = "default_max_iter"))]
        max_iter: usize,
    },
    /// 随机森林分类器, 分级大于 `positive_above` 的样本为正类.
    RandomForest {
        /// 树的棵数.
        #[cfg_attr(feature = "serde", serde(default = "default_trees"))]
        n_trees: usize,
        /// 最大深度, `None` 表示不限制.
        #[cfg_attr(feature = "serde", serde(default = "default_depth"))]
        max_depth: Option<usize>,
        /// 随机种子. 每折使用相同的种子.
        #[cfg_attr(feature = "serde", serde(default = "default_seed"))]
        seed: u64,
        /// 正类阈值.
        #[cfg_attr(feature = "serde", serde(default = "default_positive_above"))]
        positive_above: f64,
    },
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::Ridge {
            alpha: 1.0,
            fit_intercept: true,
            normalize: true,
        }
    }
}

impl FromStr for ModelKind {
    type Err = GradingError;

    /// 由名称得到使用默认超参数的模型.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ridge" => Ok(Self::default()),
            "lasso" => Ok(Self::Lasso {
                alpha: 1.0,
                fit_intercept: true,
                normalize: true,
            }),
            "linear" | "ols" => Ok(Self::Linear {
                fit_intercept: true,
            }),
            "logistic" | "logreg" => Ok(Self::Logistic {
                c: 1.0,
                fit_intercept: false,
                positive_above: 1.0,
                max_iter: 1000,
            }),
            "random_forest" | "rforest" | "rf" => Ok(Self::RandomForest {
                n_trees: 400,
                max_depth: Some(3),
                seed: DEFAULT_SEED,
                positive_above: 1.0,
            }),
            other => Err(GradingError::UnsupportedMethod(format!(
                "regression method `{other}`"
            ))),
        }
    }
}

impl ModelKind {
    /// 是否是输出概率的分类模型?
    #[inline]
    pub fn is_classifier(&self) -> bool {
        matches!(self, Self::Logistic { .. } | Self::RandomForest { .. })
    }

    /// 分类模型的正类阈值.
    #[inline]
    pub fn positive_above(&self) -> Option<f64> {
        match *self {
            Self::Logistic { positive_above, .. } | Self::RandomForest { positive_above, .. } => {
                Some(positive_above)
            }
            _ => None,
        }
    }

    /// 随机模型的种子.
    #[inline]
    pub fn seed(&self) -> Option<u64> {
        match *self {
            Self::RandomForest { seed, .. } => Some(seed),
            _ => None,
        }
    }

    /// 模型名称.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ridge { .. } => "ridge",
            Self::Lasso { .. } => "lasso",
            Self::Linear { .. } => "linear",
            Self::Logistic { .. } => "logistic",
            Self::RandomForest { .. } => "random_forest",
        }
    }

    /// 构造尚未拟合的模型.
    pub fn build(&self) -> Box<dyn Model> {
        match *self {
            Self::Ridge {
                alpha,
                fit_intercept,
                normalize,
            } => Box::new(Ridge::new(alpha, fit_intercept, normalize)),
            Self::Lasso {
                alpha,
                fit_intercept,
                normalize,
            } => Box::new(Lasso::new(alpha, fit_intercept, normalize)),
            Self::Linear { fit_intercept } => Box::new(Linear::new(fit_intercept)),
            Self::Logistic {
                c,
                fit_intercept,
                positive_above,
                max_iter,
            } => Box::new(Logistic::new(c, fit_intercept, positive_above, max_iter)),
            Self::RandomForest {
                n_trees,
                max_depth,
                seed,
                positive_above,
            } => Box::new(RandomForest::new(n_trees, max_depth, seed, positive_above)),
        }
    }
}

/// 分级变换. 拟合前作用于分级, 预测后做逆变换.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum GradeTransform {
    /// 不变换.
    #[default]
    None,
    /// 拟合 `exp(y)`, 预测值取 `ln`.
    Exp,
    /// 拟合 `ln(y)`, 预测值取 `exp`. 分级必须为正.
    Log,
}

impl FromStr for GradeTransform {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "exp" => Ok(Self::Exp),
            "log" => Ok(Self::Log),
            other => Err(GradingError::UnsupportedMethod(format!(
                "grade transform `{other}`"
            ))),
        }
    }
}

impl GradeTransform {
    /// 正变换.
    pub fn forward(&self, y: ArrayView1<'_, f64>) -> GradingResult<Array1<f64>> {
        match self {
            Self::None => Ok(y.to_owned()),
            Self::Exp => Ok(y.mapv(f64::exp)),
            Self::Log => {
                if let Some(v) = y.iter().find(|v| **v <= 0.0) {
                    return Err(GradingError::UnsupportedMethod(format!(
                        "log transform of non-positive grade {v}"
                    )));
                }
                Ok(y.mapv(f64::ln))
            }
        }
    }

    /// 逆变换.
    ///
    /// `Exp` 的逆变换遇到非正的预测值时, 先截断到 `f64::MIN_POSITIVE` 再取对数,
    /// 并记录一条警告.
    pub fn inverse(&self, y: ArrayView1<'_, f64>) -> Array1<f64> {
        match self {
            Self::None => y.to_owned(),
            Self::Exp => {
                let bad = y.iter().filter(|v| **v <= 0.0).count();
                if bad > 0 {
                    warn!("{bad} non-positive predictions clamped before ln");
                }
                y.mapv(|v| v.max(f64::MIN_POSITIVE).ln())
            }
            Self::Log => y.mapv(f64::exp),
        }
    }
}
