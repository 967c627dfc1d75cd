//! 评估指标.

use itertools::Itertools;
use ndarray::ArrayView1;
use ordered_float::OrderedFloat;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 交叉验证预测的评估结果.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Metrics {
    /// 均方误差.
    pub mse: f64,
    /// 平均绝对误差.
    pub mae: f64,
    /// 决定系数.
    pub r2: f64,
    /// Pearson 相关系数.
    pub pearson: f64,
    /// Spearman 秩相关系数.
    pub spearman: f64,
    /// ROC 曲线下面积, 仅对分类模型计算.
    pub auc: Option<f64>,
}

impl Metrics {
    /// 回归指标.
    pub fn regression(truth: ArrayView1<'_, f64>, pred: ArrayView1<'_, f64>) -> Self {
        Self {
            mse: mse(truth, pred),
            mae: mae(truth, pred),
            r2: r2(truth, pred),
            pearson: pearson(truth, pred),
            spearman: spearman(truth, pred),
            auc: None,
        }
    }

    /// 分类指标. `labels` 为 `0/1` 标签, `scores` 为正类概率.
    pub fn classification(labels: ArrayView1<'_, f64>, scores: ArrayView1<'_, f64>) -> Self {
        Self {
            auc: roc_auc(labels, scores),
            ..Self::regression(labels, scores)
        }
    }
}

/// 均方误差.
pub fn mse(truth: ArrayView1<'_, f64>, pred: ArrayView1<'_, f64>) -> f64 {
    (&truth - &pred).mapv(|d| d * d).mean().unwrap_or(f64::NAN)
}

/// 平均绝对误差.
pub fn mae(truth: ArrayView1<'_, f64>, pred: ArrayView1<'_, f64>) -> f64 {
    (&truth - &pred).mapv(f64::abs).mean().unwrap_or(f64::NAN)
}

/// 决定系数 `1 - SS_res / SS_tot`. 真值为常数时, 完全拟合返回 `1`, 否则返回 `0`.
pub fn r2(truth: ArrayView1<'_, f64>, pred: ArrayView1<'_, f64>) -> f64 {
    let Some(mean) = truth.mean() else {
        return f64::NAN;
    };
    let ss_res: f64 = (&truth - &pred).mapv(|d| d * d).sum();
    let ss_tot: f64 = truth.mapv(|v| (v - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Pearson 相关系数. 任一序列方差为零时返回 `NaN`.
pub fn pearson(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let (Some(ma), Some(mb)) = (a.mean(), b.mean()) else {
        return f64::NAN;
    };
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    if saa == 0.0 || sbb == 0.0 {
        return f64::NAN;
    }
    sab / (saa * sbb).sqrt()
}

/// 平均秩 (从 `1` 开始), 并列值取平均秩.
pub fn ranks(v: ArrayView1<'_, f64>) -> Vec<f64> {
    let order = (0..v.len()).sorted_by_key(|i| OrderedFloat(v[*i])).collect_vec();
    let mut out = vec![0.0; v.len()];
    let mut start = 0;
    for (_, run) in &order.iter().group_by(|i| OrderedFloat(v[**i])) {
        let run = run.collect_vec();
        let rank = start as f64 + (run.len() + 1) as f64 / 2.0;
        for i in &run {
            out[**i] = rank;
        }
        start += run.len();
    }
    out
}

/// Spearman 秩相关系数.
pub fn spearman(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let (ra, rb) = (ranks(a), ranks(b));
    pearson(ArrayView1::from(&ra), ArrayView1::from(&rb))
}

/// ROC 曲线下面积 (Mann-Whitney 统计量). 只有一个类别时返回 `None`.
pub fn roc_auc(labels: ArrayView1<'_, f64>, scores: ArrayView1<'_, f64>) -> Option<f64> {
    let r = ranks(scores);
    let positives = labels.iter().filter(|l| **l > 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let rank_sum: f64 = labels
        .iter()
        .zip(&r)
        .filter(|(l, _)| **l > 0.5)
        .map(|(_, r)| r)
        .sum();
    let (p, n) = (positives as f64, negatives as f64);
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_errors() {
        let t = array![1.0, 2.0, 3.0, 4.0];
        let p = array![1.5, 2.0, 2.0, 4.0];
        assert_abs_diff_eq!(mse(t.view(), p.view()), (0.25 + 1.0) / 4.0);
        assert_abs_diff_eq!(mae(t.view(), p.view()), 1.5 / 4.0);
        assert_abs_diff_eq!(r2(t.view(), t.view()), 1.0);
        assert_abs_diff_eq!(r2(t.view(), p.view()), 1.0 - 1.25 / 5.0);
    }

    #[test]
    fn test_correlations() {
        let a = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = array![2.0, 4.0, 6.0, 8.0, 10.0];
        let c = array![1.0, 8.0, 27.0, 64.0, 125.0];
        assert_abs_diff_eq!(pearson(a.view(), b.view()), 1.0, epsilon = 1e-12);
        assert!(pearson(a.view(), c.view()) < 1.0);
        assert_abs_diff_eq!(spearman(a.view(), c.view()), 1.0, epsilon = 1e-12);
        assert!(pearson(a.view(), array![1.0, 1.0, 1.0, 1.0, 1.0].view()).is_nan());
    }

    #[test]
    fn test_ranks_with_ties() {
        assert_eq!(ranks(array![10.0, 20.0, 10.0, 5.0].view()), vec![2.5, 4.0, 2.5, 1.0]);
    }

    #[test]
    fn test_auc() {
        let labels = array![0.0, 0.0, 1.0, 1.0];
        assert_abs_diff_eq!(roc_auc(labels.view(), array![0.1, 0.2, 0.8, 0.9].view()).unwrap(), 1.0);
        assert_abs_diff_eq!(roc_auc(labels.view(), array![0.9, 0.8, 0.2, 0.1].view()).unwrap(), 0.0);
        assert_abs_diff_eq!(roc_auc(labels.view(), array![0.5, 0.5, 0.5, 0.5].view()).unwrap(), 0.5);
        assert!(roc_auc(array![1.0, 1.0].view(), array![0.1, 0.2].view()).is_none());
    }
}
