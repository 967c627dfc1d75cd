//! Leave-one-out 与 leave-one-group-out 交叉验证.
//!
//! 每折的统计量 (PCA, 特征均值) 都封装在 [`FoldStats`] 中, 只由训练折计算,
//! 随后同时作用于训练折和测试折. 各折互相独立, 可以并行执行,
//! 结果按样本原始顺序重新组装.

use std::str::FromStr;

use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::metrics::{self, Metrics};
use super::{GradeTransform, ModelKind};
use crate::config::{FeatureConfig, RegressionConfig};
use crate::data::par::try_map_indexed;
use crate::pca::{FeatureFit, Pca};
use crate::{GradingError, GradingResult};

/// 交叉验证划分方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Split {
    /// 每折留出一个样本.
    LeaveOneOut,
    /// 每折留出一个分组 (同一患者的全部样本).
    #[default]
    LeaveOneGroupOut,
}

impl FromStr for Split {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loo" | "leave_one_out" => Ok(Self::LeaveOneOut),
            "logo" | "leave_one_group_out" => Ok(Self::LeaveOneGroupOut),
            other => Err(GradingError::UnsupportedMethod(format!("split `{other}`"))),
        }
    }
}

/// 单折的样本划分.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    /// 训练样本下标, 升序.
    pub train: Vec<usize>,
    /// 测试样本下标, 升序.
    pub test: Vec<usize>,
    /// 留出的分组.
    pub group: Option<i64>,
}

impl Split {
    /// 生成 `n` 个样本上的全部折.
    ///
    /// Leave-one-group-out 按分组值升序生成各折, 需要与样本一一对应的 `groups`.
    pub fn folds(&self, n: usize, groups: Option<&[i64]>) -> GradingResult<Vec<Fold>> {
        if n < 2 {
            return Err(GradingError::ShapeMismatch(format!(
                "cross validation needs at least 2 samples, got {n}"
            )));
        }
        match self {
            Split::LeaveOneOut => Ok((0..n)
                .map(|i| Fold {
                    train: (0..n).filter(|j| *j != i).collect(),
                    test: vec![i],
                    group: None,
                })
                .collect()),
            Split::LeaveOneGroupOut => {
                let groups = groups.ok_or_else(|| {
                    GradingError::UnsupportedMethod(
                        "leave-one-group-out without group labels".to_owned(),
                    )
                })?;
                if groups.len() != n {
                    return Err(GradingError::ShapeMismatch(format!(
                        "{n} samples but {} group labels",
                        groups.len()
                    )));
                }
                let unique = groups.iter().copied().sorted().dedup().collect_vec();
                if unique.len() < 2 {
                    return Err(GradingError::ShapeMismatch(
                        "leave-one-group-out needs at least 2 groups".to_owned(),
                    ));
                }
                Ok(unique
                    .into_iter()
                    .map(|g| {
                        let (test, train): (Vec<usize>, Vec<usize>) =
                            (0..n).partition(|i| groups[*i] == g);
                        Fold {
                            train,
                            test,
                            group: Some(g),
                        }
                    })
                    .collect())
            }
        }
    }
}

/// 只由训练折计算的特征变换.
#[derive(Clone, Debug, Default)]
pub struct FoldStats {
    /// 训练折上拟合的 PCA.
    pub pca: Option<Pca>,
    /// PCA 之后训练折的特征均值, 用于中心化.
    pub mean: Option<Array1<f64>>,
}

impl FoldStats {
    /// 在训练折 `x_train` 上拟合.
    pub fn fit(
        x_train: ArrayView2<'_, f64>,
        pca: Option<&FeatureConfig>,
        standardize: bool,
    ) -> GradingResult<Self> {
        let pca = pca
            .map(|c| Pca::fit(x_train, c.n_components, c.whiten))
            .transpose()?;
        let mean = if standardize {
            let projected = match &pca {
                Some(p) => p.transform(x_train)?,
                None => x_train.to_owned(),
            };
            projected.mean_axis(Axis(0))
        } else {
            None
        };
        Ok(Self { pca, mean })
    }

    /// 将变换作用于 `x`.
    pub fn apply(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array2<f64>> {
        let mut out = match &self.pca {
            Some(p) => p.transform(x)?,
            None => x.to_owned(),
        };
        if let Some(mean) = &self.mean {
            out -= mean;
        }
        Ok(out)
    }
}

/// 单折的结果.
struct FoldResult {
    test: Vec<usize>,
    predictions: Array1<f64>,
    coefficients: Array1<f64>,
    intercept: f64,
}

/// 交叉验证结果.
#[derive(Clone, Debug, PartialEq)]
pub struct CvOutcome {
    /// 按样本顺序排列的折外预测 (已做逆变换). 分类模型为正类概率.
    pub predictions: Array1<f64>,
    /// 各折系数的平均. 各折特征维数不同 (如按方差比例逐折选择主成分数) 时为 `None`.
    pub coefficients: Option<Array1<f64>>,
    /// 各折截距的平均.
    pub intercept: f64,
    /// 折数.
    pub n_folds: usize,
    /// 评估指标.
    pub metrics: Metrics,
}

/// 交叉验证.
///
/// `pca` 给定时在特征上做 PCA: [`FeatureFit::PerFold`] 每折在训练折上单独拟合;
/// [`FeatureFit::Global`] 在全部样本上拟合一次, 此时只有回归模型是折外的.
///
/// # 错误
///
/// 1. 特征, 分级, 分组长度不一致时返回 [`GradingError::ShapeMismatch`].
/// 2. Leave-one-group-out 缺少分组, 分类模型搭配分级变换,
///   或对非正分级做对数变换时返回 [`GradingError::UnsupportedMethod`].
pub fn cross_validate(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    groups: Option<&[i64]>,
    config: &RegressionConfig,
    pca: Option<&FeatureConfig>,
) -> GradingResult<CvOutcome> {
    let n = x.nrows();
    if y.len() != n {
        return Err(GradingError::ShapeMismatch(format!(
            "{n} feature rows but {} grades",
            y.len()
        )));
    }
    let kind = &config.model;
    if kind.is_classifier() && config.transform != GradeTransform::None {
        return Err(GradingError::UnsupportedMethod(format!(
            "{} with {:?} grade transform",
            kind.name(),
            config.transform
        )));
    }
    let target = config.transform.forward(y)?;
    let folds = config.split.folds(n, groups)?;

    let (x, per_fold) = match pca {
        Some(c) if c.fit == FeatureFit::Global => {
            warn!("pca fitted on all samples, only the regression is out-of-fold");
            let (_, scores) = Pca::fit_transform(x, c.n_components, c.whiten)?;
            (scores, None)
        }
        other => (x.to_owned(), other),
    };
    info!(
        "{} with {:?} over {} folds, {} samples",
        kind.name(),
        config.split,
        folds.len(),
        n
    );

    let results = try_map_indexed(folds.len(), |i| {
        run_fold(
            i,
            &folds[i],
            x.view(),
            target.view(),
            kind,
            per_fold,
            config.standardize,
        )
    })?;

    let mut predictions = Array1::from_elem(n, f64::NAN);
    for r in &results {
        for (k, idx) in r.test.iter().enumerate() {
            predictions[*idx] = r.predictions[k];
        }
    }
    let predictions = config.transform.inverse(predictions.view());

    let widths = results.iter().map(|r| r.coefficients.len()).dedup().count();
    let coefficients = if widths == 1 {
        let mut sum = Array1::<f64>::zeros(results[0].coefficients.len());
        for r in &results {
            sum += &r.coefficients;
        }
        Some(sum / results.len() as f64)
    } else {
        debug!("folds have different feature widths, coefficients not averaged");
        None
    };
    let intercept = results.iter().map(|r| r.intercept).sum::<f64>() / results.len() as f64;

    let metrics = match kind.positive_above() {
        Some(threshold) => {
            let labels = y.mapv(|v| if v > threshold { 1.0 } else { 0.0 });
            Metrics::classification(labels.view(), predictions.view())
        }
        None => Metrics::regression(y, predictions.view()),
    };
    info!(
        "mse {:.4}, r2 {:.4}, spearman {:.4}{}",
        metrics.mse,
        metrics.r2,
        metrics.spearman,
        metrics.auc.map(|a| format!(", auc {a:.4}")).unwrap_or_default()
    );

    Ok(CvOutcome {
        predictions,
        coefficients,
        intercept,
        n_folds: results.len(),
        metrics,
    })
}

fn run_fold(
    index: usize,
    fold: &Fold,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    kind: &ModelKind,
    pca: Option<&FeatureConfig>,
    standardize: bool,
) -> GradingResult<FoldResult> {
    let x_train = x.select(Axis(0), &fold.train);
    let y_train = y.select(Axis(0), &fold.train);
    let stats = FoldStats::fit(x_train.view(), pca, standardize)?;
    let x_train = stats.apply(x_train.view())?;
    let x_test = stats.apply(x.select(Axis(0), &fold.test).view())?;

    let mut model = kind.build();
    model.fit(x_train.view(), y_train.view())?;
    let predictions = model.predict(x_test.view())?;
    debug!(
        "fold {index}: {} train, {} test, {} features",
        fold.train.len(),
        fold.test.len(),
        x_train.ncols()
    );
    Ok(FoldResult {
        test: fold.test.clone(),
        predictions,
        coefficients: model.coefficients().to_owned(),
        intercept: model.intercept(),
    })
}

/// 按位置划分训练/测试集的单次评估结果.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitOutcome {
    /// 测试集预测.
    pub predictions: Array1<f64>,
    /// 模型系数.
    pub coefficients: Array1<f64>,
    /// 截距.
    pub intercept: f64,
    /// 测试集均方误差.
    pub mse: f64,
    /// 测试集决定系数.
    pub r2: f64,
}

/// 前 `split` 个样本训练, 其余样本测试.
pub fn regress_split(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    split: usize,
    kind: &ModelKind,
    standardize: bool,
) -> GradingResult<SplitOutcome> {
    let n = x.nrows();
    if y.len() != n {
        return Err(GradingError::ShapeMismatch(format!(
            "{n} feature rows but {} grades",
            y.len()
        )));
    }
    if split == 0 || split >= n {
        return Err(GradingError::ShapeMismatch(format!(
            "split at {split} leaves an empty side of {n} samples"
        )));
    }
    let fold = Fold {
        train: (0..split).collect(),
        test: (split..n).collect(),
        group: None,
    };
    let r = run_fold(0, &fold, x, y, kind, None, standardize)?;
    let truth = y.slice(ndarray::s![split..]);
    Ok(SplitOutcome {
        mse: metrics::mse(truth, r.predictions.view()),
        r2: metrics::r2(truth, r.predictions.view()),
        predictions: r.predictions,
        coefficients: r.coefficients,
        intercept: r.intercept,
    })
}
