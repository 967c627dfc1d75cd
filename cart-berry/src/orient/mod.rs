//! 体定向.
//!
//! 估计样本主轴相对切片轴 (`z`) 的两个倾角, 再在 `(z, W)` 和 `(z, H)`
//! 平面内依次做双线性旋转, 使样本主轴与切片轴平行.
//!
//! # 注意
//!
//! 体数据字节数超过阈值时不做任何处理, 结果为 [`Orientation::Skipped`].
//! 这不是错误, 调用方需要自行匹配.

use std::str::FromStr;

use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::OrientConfig;
use crate::fitting::line_slope;
use crate::threshold::otsu_threshold_3d;
use crate::{BoundingBox, GradingError, GradingResult, Volume, VoxelGrid};

mod rotate;

use rotate::{rotate_planes, ANGLE_EPS};

/// 定向方法. 数字编号与历史命令行参数保持一致.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum OrientMethod {
    /// `0`: 不旋转.
    None,
    /// `1`: 包围盒中心随切片序号的直线拟合.
    BoundingBox,
    /// `2`: 前景点云主成分.
    Pca,
    /// `3`: 以包围盒结果为起点, 最小化点云横截面方差.
    GradientDescent,
    /// `4`: 方法 1 与方法 2 的平均.
    Average,
}

impl OrientMethod {
    /// 由历史数字编号获取方法.
    pub fn from_code(code: u8) -> GradingResult<Self> {
        Ok(match code {
            0 => Self::None,
            1 => Self::BoundingBox,
            2 => Self::Pca,
            3 => Self::GradientDescent,
            4 => Self::Average,
            _ => {
                return Err(GradingError::UnsupportedMethod(format!(
                    "orientation method {code}"
                )))
            }
        })
    }
}

impl FromStr for OrientMethod {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u8>() {
            return Self::from_code(code);
        }
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "bbox" | "bounding_box" => Ok(Self::BoundingBox),
            "pca" => Ok(Self::Pca),
            "gradient" | "gradient_descent" => Ok(Self::GradientDescent),
            "average" | "mean" => Ok(Self::Average),
            other => Err(GradingError::UnsupportedMethod(format!(
                "orientation method `{other}`"
            ))),
        }
    }
}

/// 样本主轴的两个倾角, 以度为单位.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Angles {
    /// `(z, W)` 平面内的倾角, 即主轴 `W` 分量随深度的变化.
    pub zw: f64,
    /// `(z, H)` 平面内的倾角.
    pub zh: f64,
}

impl Angles {
    /// 零角度.
    pub const ZERO: Self = Self { zw: 0.0, zh: 0.0 };

    /// 两组角度的平均.
    #[inline]
    pub fn mean(&self, other: &Self) -> Self {
        Self {
            zw: (self.zw + other.zw) / 2.0,
            zh: (self.zh + other.zh) / 2.0,
        }
    }

    /// 由 `(z, H, W)` 方向向量计算倾角.
    fn from_axis(v: [f64; 3]) -> Self {
        let [vz, vh, vw] = v;
        if vz.abs() < f64::EPSILON {
            return Self::ZERO;
        }
        Self {
            zw: (vw / vz).atan().to_degrees(),
            zh: (vh / vz).atan().to_degrees(),
        }
    }

    /// 倾角对应的单位方向向量 `(z, H, W)`.
    fn axis(&self) -> [f64; 3] {
        let (tw, th) = (self.zw.to_radians().tan(), self.zh.to_radians().tan());
        let norm = (1.0 + tw * tw + th * th).sqrt();
        [1.0 / norm, th / norm, tw / norm]
    }
}

/// 定向结果.
#[derive(Clone, Debug)]
pub enum Orientation {
    /// 已定向 (也包括方法为 [`OrientMethod::None`] 的情形).
    Oriented {
        /// 旋转后的体数据.
        volume: Volume,
        /// 估计的倾角.
        angles: Angles,
    },

    /// 体数据过大, 原样返回.
    Skipped {
        /// 未经修改的输入体数据.
        volume: Volume,
        /// 输入的字节数.
        bytes: usize,
    },
}

impl Orientation {
    /// 使用的倾角. 跳过时为零.
    #[inline]
    pub fn angles(&self) -> Angles {
        match self {
            Self::Oriented { angles, .. } => *angles,
            Self::Skipped { .. } => Angles::ZERO,
        }
    }

    /// 是否被跳过?
    #[inline]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// 取出体数据.
    #[inline]
    pub fn into_volume(self) -> Volume {
        match self {
            Self::Oriented { volume, .. } | Self::Skipped { volume, .. } => volume,
        }
    }
}

/// 对体数据定向.
///
/// # 参数
///
/// 1. `bboxes` 是加载时得到的每个切片的包围盒, 长度必须等于切片数.
///   仅包围盒相关的方法会用到它.
/// 2. `config.max_bytes` 是定向的体数据大小上限.
pub fn orient(
    volume: Volume,
    bboxes: &[BoundingBox],
    config: &OrientConfig,
) -> GradingResult<Orientation> {
    let bytes = volume.size();
    if bytes > config.max_bytes {
        warn!(
            "volume of {bytes} bytes exceeds {} bytes, orientation skipped",
            config.max_bytes
        );
        return Ok(Orientation::Skipped { volume, bytes });
    }
    let angles = estimate_angles(&volume, bboxes, config)?;
    info!(
        "orientation {:?}: zw = {:.3}°, zh = {:.3}°",
        config.method, angles.zw, angles.zh
    );
    let volume = rotate(&volume, angles);
    Ok(Orientation::Oriented { volume, angles })
}

/// 按配置的方法估计倾角.
pub fn estimate_angles(
    volume: &Volume,
    bboxes: &[BoundingBox],
    config: &OrientConfig,
) -> GradingResult<Angles> {
    let needs_bboxes = matches!(
        config.method,
        OrientMethod::BoundingBox | OrientMethod::GradientDescent | OrientMethod::Average
    );
    if needs_bboxes && bboxes.len() != volume.len_z() {
        return Err(GradingError::ShapeMismatch(format!(
            "{} bounding boxes for {} slices",
            bboxes.len(),
            volume.len_z()
        )));
    }

    Ok(match config.method {
        OrientMethod::None => Angles::ZERO,
        OrientMethod::BoundingBox => bbox_angles(bboxes)?,
        OrientMethod::Pca => {
            let cov = foreground_covariance(volume, config.max_points);
            pca_angles(&cov)?
        }
        OrientMethod::GradientDescent => {
            let cov = foreground_covariance(volume, config.max_points);
            refine_angles(&cov, bbox_angles(bboxes)?, config.max_iterations)
        }
        OrientMethod::Average => {
            let cov = foreground_covariance(volume, config.max_points);
            bbox_angles(bboxes)?.mean(&pca_angles(&cov)?)
        }
    })
}

/// 按给定倾角旋转体数据: 先在每个 `(z, W)` 平面内旋转, 再在每个 `(z, H)` 平面内旋转.
pub fn rotate(volume: &Volume, angles: Angles) -> Volume {
    let data = rotate_planes(volume.data(), Axis(1), angles.zw);
    Volume::new(rotate_planes(data.view(), Axis(2), angles.zh))
}

/// 包围盒中心随切片序号的直线拟合.
///
/// 空包围盒被忽略. 有效切片少于两个时无法拟合, 返回零角度.
pub fn bbox_angles(bboxes: &[BoundingBox]) -> GradingResult<Angles> {
    let (mut z, mut ch, mut cw) = (vec![], vec![], vec![]);
    for (i, center) in bboxes.iter().enumerate().filter_map(|(i, b)| Some((i, b.center()?))) {
        z.push(i as f64);
        ch.push(center.0);
        cw.push(center.1);
    }
    if z.len() < 2 {
        warn!("only {} non-empty bounding boxes, assuming zero tilt", z.len());
        return Ok(Angles::ZERO);
    }
    let z = Array1::from(z);
    let zw = line_slope(z.view(), Array1::from(cw).view())?;
    let zh = line_slope(z.view(), Array1::from(ch).view())?;
    Ok(Angles {
        zw: zw.atan().to_degrees(),
        zh: zh.atan().to_degrees(),
    })
}

/// Otsu 前景体素坐标 `(z, H, W)` 的协方差矩阵. 前景点超过 `max_points`
/// 时等间隔抽样, 因此结果是确定的.
pub fn foreground_covariance(volume: &Volume, max_points: usize) -> Array2<f64> {
    let (mask, _) = otsu_threshold_3d(volume.data());
    let count = mask.count();
    if count < 2 {
        return Array2::zeros((3, 3));
    }
    let stride = count.div_ceil(max_points.max(1));
    let points: Vec<[f64; 3]> = mask
        .data()
        .indexed_iter()
        .filter(|(_, v)| **v == 1)
        .step_by(stride)
        .map(|((z, h, w), _)| [z as f64, h as f64, w as f64])
        .collect();
    debug!("{} of {count} foreground voxels used for covariance", points.len());
    covariance(&points)
}

/// 点云协方差 (总体方差口径).
fn covariance(points: &[[f64; 3]]) -> Array2<f64> {
    let n = points.len() as f64;
    let mut mean = [0.0; 3];
    for p in points {
        for k in 0..3 {
            mean[k] += p[k] / n;
        }
    }
    let mut cov = Array2::zeros((3, 3));
    for p in points {
        for i in 0..3 {
            for j in 0..3 {
                cov[(i, j)] += (p[i] - mean[i]) * (p[j] - mean[j]) / n;
            }
        }
    }
    cov
}

/// 由点云协方差求样本轴倾角.
///
/// 在三个特征向量中选取与切片轴夹角最小者作为样本轴, 以免扁平样本的主成分落在水平面内.
pub fn pca_angles(cov: &Array2<f64>) -> GradingResult<Angles> {
    if cov.iter().all(|v| *v == 0.0) {
        warn!("degenerate foreground point cloud, assuming zero tilt");
        return Ok(Angles::ZERO);
    }
    let (_, vecs) = cov.eigh(UPLO::Lower)?;
    let best = vecs
        .axis_iter(Axis(1))
        .max_by(|a, b| a[0].abs().total_cmp(&b[0].abs()))
        .map(|v| {
            let s = v[0].signum();
            [v[0] * s, v[1] * s, v[2] * s]
        })
        .unwrap_or([1.0, 0.0, 0.0]);
    Ok(Angles::from_axis(best))
}

/// 点云在与 `angles` 对应的轴正交的截面上的方差.
fn cross_section_variance(cov: &Array2<f64>, angles: &Angles) -> f64 {
    let u = angles.axis();
    let mut along = 0.0;
    for i in 0..3 {
        for j in 0..3 {
            along += u[i] * cov[(i, j)] * u[j];
        }
    }
    cov.diag().sum() - along
}

/// 从 `start` 出发, 以步长逐次减半的坐标搜索最小化截面方差.
///
/// 角度限制在 `(-45°, 45°)` 内. 步长小于 0.01° 或迭代次数用尽时停止.
pub fn refine_angles(cov: &Array2<f64>, start: Angles, max_iterations: usize) -> Angles {
    const LIMIT: f64 = 45.0;
    let clamp = |a: f64| a.clamp(-LIMIT + ANGLE_EPS, LIMIT - ANGLE_EPS);

    let mut cur = Angles {
        zw: clamp(start.zw),
        zh: clamp(start.zh),
    };
    let mut cur_val = cross_section_variance(cov, &cur);
    let mut step = 1.0;
    for _ in 0..max_iterations {
        if step < 0.01 {
            break;
        }
        let candidates = [
            Angles { zw: clamp(cur.zw + step), ..cur },
            Angles { zw: clamp(cur.zw - step), ..cur },
            Angles { zh: clamp(cur.zh + step), ..cur },
            Angles { zh: clamp(cur.zh - step), ..cur },
        ];
        let best = candidates
            .iter()
            .map(|a| (cross_section_variance(cov, a), *a))
            .min_by(|x, y| x.0.total_cmp(&y.0));
        match best {
            Some((val, a)) if val < cur_val => {
                cur = a;
                cur_val = val;
            }
            _ => step /= 2.0,
        }
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn line_cov(dir: [f64; 3], n: usize) -> Array2<f64> {
        // 沿 dir 的直线, 叠加一个小的正交抖动使协方差满秩.
        let points: Vec<[f64; 3]> = (0..n)
            .map(|i| {
                let t = i as f64 - n as f64 / 2.0;
                let j = if i % 2 == 0 { 0.5 } else { -0.5 };
                [t * dir[0], t * dir[1] + j, t * dir[2] - j]
            })
            .collect();
        covariance(&points)
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("1".parse::<OrientMethod>().unwrap(), OrientMethod::BoundingBox);
        assert_eq!("pca".parse::<OrientMethod>().unwrap(), OrientMethod::Pca);
        assert_eq!("4".parse::<OrientMethod>().unwrap(), OrientMethod::Average);
        assert!(matches!(
            "7".parse::<OrientMethod>(),
            Err(GradingError::UnsupportedMethod(_))
        ));
        assert!("spin".parse::<OrientMethod>().is_err());
    }

    #[test]
    fn test_bbox_angles() {
        let bboxes: Vec<BoundingBox> = (0..50)
            .map(|z| {
                let shift = z / 10;
                BoundingBox {
                    left: 100 + shift,
                    right: 200 + shift,
                    top: 100,
                    bottom: 200,
                }
            })
            .collect();
        let a = bbox_angles(&bboxes).unwrap();
        assert!(a.zw > 0.0 && a.zw < 10.0);
        assert_abs_diff_eq!(a.zh, 0.0, epsilon = 1e-9);
    }

    /// 空包围盒不参与拟合; 少于两个有效切片时为零角度.
    #[test]
    fn test_bbox_angles_sparse() {
        let mut bboxes = vec![BoundingBox::EMPTY; 10];
        assert_eq!(bbox_angles(&bboxes).unwrap(), Angles::ZERO);
        bboxes[2] = BoundingBox {
            left: 10,
            right: 20,
            top: 10,
            bottom: 20,
        };
        bboxes[8] = BoundingBox {
            left: 16,
            right: 26,
            top: 10,
            bottom: 20,
        };
        let a = bbox_angles(&bboxes).unwrap();
        assert_abs_diff_eq!(a.zw, 45.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pca_and_refine_agree() {
        let dir = [1.0, 0.2, 0.3];
        let cov = line_cov(dir, 400);
        let expected = Angles::from_axis(dir);
        let pca = pca_angles(&cov).unwrap();
        assert_abs_diff_eq!(pca.zw, expected.zw, epsilon = 0.1);
        assert_abs_diff_eq!(pca.zh, expected.zh, epsilon = 0.1);
        let gd = refine_angles(&cov, Angles::ZERO, 1000);
        assert_abs_diff_eq!(gd.zw, pca.zw, epsilon = 0.05);
        assert_abs_diff_eq!(gd.zh, pca.zh, epsilon = 0.05);
    }

    #[test]
    fn test_angles_axis_round_trip() {
        let a = Angles { zw: 12.0, zh: -7.5 };
        let back = Angles::from_axis(a.axis());
        assert_abs_diff_eq!(back.zw, a.zw, epsilon = 1e-9);
        assert_abs_diff_eq!(back.zh, a.zh, epsilon = 1e-9);
    }

    #[test]
    fn test_skip_large_volume() {
        let v = Volume::new(Array3::from_elem((4, 4, 4), 3u8));
        let cfg = OrientConfig {
            max_bytes: 10,
            ..Default::default()
        };
        let out = orient(v.clone(), &[], &cfg).unwrap();
        assert!(out.is_skipped());
        assert_eq!(out.angles(), Angles::ZERO);
        assert_eq!(out.into_volume(), v);
    }

    #[test]
    fn test_bbox_count_checked() {
        let v = Volume::new(Array3::zeros((4, 4, 4)));
        let cfg = OrientConfig::default();
        assert!(matches!(
            orient(v, &[BoundingBox::EMPTY; 3], &cfg),
            Err(GradingError::ShapeMismatch(_))
        ));
    }

    /// 竖直的样本不应被旋转.
    #[test]
    fn test_upright_sample_untouched() {
        let mut data = Array3::<u8>::zeros((12, 16, 16));
        data.slice_mut(ndarray::s![.., 4..12, 4..12]).fill(200);
        let v = Volume::new(data);
        let bboxes = vec![
            BoundingBox {
                left: 4,
                right: 12,
                top: 4,
                bottom: 12
            };
            12
        ];
        let cfg = OrientConfig {
            method: OrientMethod::Average,
            ..Default::default()
        };
        let out = orient(v.clone(), &bboxes, &cfg).unwrap();
        let a = out.angles();
        assert_abs_diff_eq!(a.zw, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(a.zh, 0.0, epsilon = 1e-6);
        assert_eq!(out.into_volume(), v);
    }
}
