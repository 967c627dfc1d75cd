//! 骨-软骨界面分割.
//!
//! 分割器只需要实现 [`Segmenter`]: 输入体数据, 输出同形状的二值掩膜.
//! 本模块自带基于 k-means 的实现, 外部的神经网络通过 [`FnSegmenter`] 接入,
//! 事先保存好的掩膜切片通过 [`PrecomputedSegmenter`] 接入.

use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, info};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SegmentationConfig;
use crate::consts::gray::{MASK_BACKGROUND, MASK_FOREGROUND};
use crate::data::par::map_indexed;
use crate::dataset::load_stack;
use crate::threshold::{histogram, Histogram};
use crate::{GradingError, GradingResult, Mask, Volume, VoxelGrid};

/// 分割方法.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum SegmentationMethod {
    /// 平面级 1D k-means.
    #[default]
    KMeans,
    /// 从磁盘读取事先保存的掩膜切片.
    Precomputed,
    /// 由调用方提供的外部模型.
    External,
}

impl FromStr for SegmentationMethod {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kmeans" | "k-means" => Ok(Self::KMeans),
            "precomputed" | "masks" => Ok(Self::Precomputed),
            "external" | "torch" | "cntk" | "unet" => Ok(Self::External),
            other => Err(GradingError::UnsupportedMethod(format!(
                "segmentation method `{other}`"
            ))),
        }
    }
}

/// 分割器.
pub trait Segmenter: Send + Sync {
    /// 对 `volume` 分割, 返回与之同形状的掩膜.
    fn segment(&self, volume: &Volume) -> GradingResult<Mask>;
}

/// 按深度方向长度确定底部忽略的切片数.
#[inline]
pub fn bottom_offset_for(depth: usize) -> usize {
    match depth {
        0..=999 => 0,
        1000..=1599 => 20,
        _ => 50,
    }
}

/// 直方图上的一维 k-means, 返回升序排列的聚类中心.
///
/// 中心初始化为最小值与最大值之间的等分点, 因此结果是确定的.
/// 直方图为空时返回空数组.
pub fn kmeans_1d(hist: &Histogram, k: usize, max_iter: usize) -> Vec<f64> {
    let present = || hist.iter().enumerate().filter(|(_, c)| **c > 0);
    let (Some((lo, _)), Some((hi, _))) = (present().next(), present().last()) else {
        return vec![];
    };
    let k = k.max(1);
    let (lo, hi) = (lo as f64, hi as f64);
    let mut centers: Vec<f64> = if k == 1 {
        vec![(lo + hi) / 2.0]
    } else {
        (0..k)
            .map(|i| lo + (hi - lo) * i as f64 / (k - 1) as f64)
            .collect()
    };

    for _ in 0..max_iter {
        let mut sums = vec![0.0; k];
        let mut weights = vec![0.0; k];
        for (v, &c) in present() {
            let j = nearest(&centers, v as f64);
            sums[j] += v as f64 * c as f64;
            weights[j] += c as f64;
        }
        let next: Vec<f64> = centers
            .iter()
            .enumerate()
            .map(|(j, old)| if weights[j] > 0.0 { sums[j] / weights[j] } else { *old })
            .collect();
        if next == centers {
            break;
        }
        centers = next;
    }
    centers.sort_by(f64::total_cmp);
    centers
}

/// 最近的中心下标. 距离相同时取下标较小者.
#[inline]
fn nearest(centers: &[f64], v: f64) -> usize {
    let mut best = 0;
    for (j, c) in centers.iter().enumerate().skip(1) {
        if (v - c).abs() < (v - centers[best]).abs() {
            best = j;
        }
    }
    best
}

/// 基于平面级 k-means 的分割器.
///
/// 对每个 `H` 平面和每个 `W` 平面分别做灰度 k-means, 亮度最高的一类视为钙化组织.
/// 两个方向的投票取平均, 不低于 `agreement` 的体素为前景.
#[derive(Clone, Debug, PartialEq)]
pub struct KMeansSegmenter {
    /// 聚类数.
    pub clusters: usize,
    /// 底部 (`z` 较小一端) 忽略的切片数, `None` 表示按深度自动确定.
    pub bottom_offset: Option<usize>,
    /// 投票一致性阈值.
    pub agreement: f64,
}

impl Default for KMeansSegmenter {
    fn default() -> Self {
        Self::from_config(&SegmentationConfig::default())
    }
}

impl KMeansSegmenter {
    /// 由配置构造.
    pub fn from_config(config: &SegmentationConfig) -> Self {
        Self {
            clusters: config.clusters,
            bottom_offset: config.bottom_offset,
            agreement: config.agreement,
        }
    }

    /// 单个平面的投票: 属于最亮一类的像素为 `1`.
    fn vote(&self, plane: ArrayView2<'_, u8>) -> Array2<u8> {
        let hist = histogram(plane);
        let centers = kmeans_1d(&hist, self.clusters, 100);
        if centers.len() < 2 || centers[0] == centers[centers.len() - 1] {
            return Array2::zeros(plane.dim());
        }
        let top = centers.len() - 1;
        plane.mapv(|p| u8::from(nearest(&centers, p as f64) == top))
    }

    /// 对 `axis` 方向上的每个平面投票, 拼回三维数组.
    fn votes_along(&self, data: ndarray::ArrayView3<'_, u8>, axis: Axis) -> Array3<u8> {
        let planes = map_indexed(data.len_of(axis), |i| self.vote(data.index_axis(axis, i)));
        let mut out = Array3::zeros(data.raw_dim());
        for (i, p) in planes.into_iter().enumerate() {
            out.index_axis_mut(axis, i).assign(&p);
        }
        out
    }
}

impl Segmenter for KMeansSegmenter {
    fn segment(&self, volume: &Volume) -> GradingResult<Mask> {
        let depth = volume.len_z();
        let offset = self
            .bottom_offset
            .unwrap_or_else(|| bottom_offset_for(depth));
        if offset >= depth {
            return Err(GradingError::SegmentationFailure(format!(
                "bottom offset {offset} leaves no slices of {depth}"
            )));
        }
        info!("k-means segmentation, {} clusters, bottom offset {offset}", self.clusters);

        let data = volume.data().slice_move(ndarray::s![offset.., .., ..]);
        let along_h = self.votes_along(data, Axis(1));
        let along_w = self.votes_along(data, Axis(2));

        let mut mask = Array3::<u8>::zeros(volume.shape());
        Zip::from(mask.slice_mut(ndarray::s![offset.., .., ..]))
            .and(&along_h)
            .and(&along_w)
            .for_each(|m, &a, &b| {
                *m = if (a as f64 + b as f64) / 2.0 >= self.agreement {
                    MASK_FOREGROUND
                } else {
                    MASK_BACKGROUND
                };
            });
        let mask = Mask::for_volume(volume, mask)?;
        debug!("{} foreground voxels", mask.count());
        Ok(mask)
    }
}

/// 将任意闭包包装为分割器. 闭包返回前景概率, 严格大于 `threshold` 的体素为前景.
pub struct FnSegmenter<F> {
    f: F,
    threshold: f32,
}

impl<F> FnSegmenter<F>
where
    F: Fn(&Volume) -> GradingResult<Array3<f32>> + Send + Sync,
{
    /// 包装闭包.
    pub fn new(f: F, threshold: f32) -> Self {
        Self { f, threshold }
    }
}

impl<F> Segmenter for FnSegmenter<F>
where
    F: Fn(&Volume) -> GradingResult<Array3<f32>> + Send + Sync,
{
    fn segment(&self, volume: &Volume) -> GradingResult<Mask> {
        let prob = (self.f)(volume)?;
        if prob.dim() != volume.shape() {
            return Err(GradingError::ShapeMismatch(format!(
                "segmenter returned {:?} for a volume of {:?}",
                prob.dim(),
                volume.shape()
            )));
        }
        Ok(Mask::from_probability(prob.view(), self.threshold))
    }
}

/// 从切片目录读取掩膜. 非零像素为前景.
#[derive(Clone, Debug)]
pub struct PrecomputedSegmenter {
    dir: PathBuf,
    workers: usize,
}

impl PrecomputedSegmenter {
    /// `dir` 是掩膜切片所在目录, 命名规则与体数据切片相同.
    pub fn new<P: Into<PathBuf>>(dir: P, workers: usize) -> Self {
        Self {
            dir: dir.into(),
            workers,
        }
    }
}

impl Segmenter for PrecomputedSegmenter {
    fn segment(&self, volume: &Volume) -> GradingResult<Mask> {
        let (stack, _) = load_stack(&self.dir, self.workers)?;
        let data = stack.into_raw().mapv(|p| u8::from(p > 0));
        Mask::for_volume(volume, data)
    }
}
