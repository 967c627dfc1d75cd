//! 中心裁剪.
//!
//! 在样本上半部分 (按深度) 的投影上估计样本中心, 然后取固定大小的水平窗口.
//! 窗口越界时夹紧到最近的合法位置, 因此输出尺寸总等于请求尺寸.

use std::ops::Range;
use std::str::FromStr;

use log::{info, warn};
use ndarray::{s, Array2, Axis};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::threshold::{
    area_to_plane, connected_components, fill_holes, largest_component, otsu_threshold_3d,
    Connectivity,
};
use crate::{GradingError, GradingResult, Idx2d, Volume, VoxelGrid};

/// 样本中心估计方法.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum CropMethod {
    /// 归一化投影阈值后最大连通区域的图像矩.
    #[default]
    Moment,
    /// Otsu 前景计数图的加权质心.
    Mass,
}

impl FromStr for CropMethod {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "moment" | "cm" => Ok(Self::Moment),
            "mass" => Ok(Self::Mass),
            other => Err(GradingError::UnsupportedMethod(format!(
                "crop method `{other}`"
            ))),
        }
    }
}

/// 大样本规则: 两个水平边长都超过 `min_side` 时, 窗口边长改为 `size`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LargeSample {
    /// 触发规则的最小边长.
    pub min_side: usize,
    /// 放大后的窗口边长.
    pub size: usize,
}

impl Default for LargeSample {
    fn default() -> Self {
        Self {
            min_side: 1300,
            size: 848,
        }
    }
}

/// 裁剪窗口 `[h0, h1) × [w0, w1)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CropWindow {
    /// 起始行.
    pub h0: usize,
    /// 结束行 (不含).
    pub h1: usize,
    /// 起始列.
    pub w0: usize,
    /// 结束列 (不含).
    pub w1: usize,
}

impl CropWindow {
    /// 行区间.
    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.h0..self.h1
    }

    /// 列区间.
    #[inline]
    pub fn cols(&self) -> Range<usize> {
        self.w0..self.w1
    }

    /// 窗口尺寸 `(高, 宽)`.
    #[inline]
    pub fn size(&self) -> Idx2d {
        (self.h1 - self.h0, self.w1 - self.w0)
    }
}

/// 上半部分 (前 `len_z / 2` 个切片) 沿深度的求和投影.
fn top_half_sum(volume: &Volume) -> Array2<f64> {
    let half = (volume.len_z() / 2).max(1);
    volume
        .data()
        .slice(s![..half, .., ..])
        .mapv(f64::from)
        .sum_axis(Axis(0))
}

/// 图像矩中心 `(行, 列)`.
///
/// 投影归一化到 `[0, 1]` 后以 0.1 二值化, 取最大的 8-连通区域并填充孔洞,
/// 中心为 `(m01 / m00, m10 / m00)`. 投影为常数时返回 `None`.
pub fn moment_center(volume: &Volume) -> Option<(f64, f64)> {
    let sum = top_half_sum(volume);
    let min = sum.iter().copied().fold(f64::INFINITY, f64::min);
    let max = sum.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return None;
    }
    let fg = sum.mapv(|v| (v - min) / (max - min) > 0.1);
    let areas = connected_components(fg.view(), Connectivity::Eight);
    let largest = largest_component(&areas)?;
    let region = fill_holes(area_to_plane(largest, fg.dim()).view());

    let (mut m00, mut m10, mut m01) = (0.0, 0.0, 0.0);
    for ((r, c), _) in region.indexed_iter().filter(|(_, v)| **v) {
        m00 += 1.0;
        m10 += c as f64;
        m01 += r as f64;
    }
    (m00 > 0.0).then(|| (m01 / m00, m10 / m00))
}

/// 质心中心 `(行, 列)`.
///
/// 上半部分 Otsu 前景在每一列上的计数作为权重. 没有前景时返回 `None`.
pub fn mass_center(volume: &Volume) -> Option<(f64, f64)> {
    let half = (volume.len_z() / 2).max(1);
    let top = volume.data().slice_move(s![..half, .., ..]);
    let (mask, _) = otsu_threshold_3d(top);
    let counts = mask.data().mapv(f64::from).sum_axis(Axis(0));
    let total = counts.sum();
    if total == 0.0 {
        return None;
    }
    let (mut ch, mut cw) = (0.0, 0.0);
    for ((r, c), &n) in counts.indexed_iter() {
        ch += r as f64 * n;
        cw += c as f64 * n;
    }
    Some((ch / total, cw / total))
}

/// 以 `center` 为中心、长度为 `size` 的区间, 夹紧到 `[0, len)` 内.
#[inline]
fn clamp_window(center: f64, size: usize, len: usize) -> Range<usize> {
    let start = (center.max(0.0) as usize).saturating_sub(size / 2).min(len - size);
    start..start + size
}

/// 中心裁剪.
///
/// # 参数
///
/// 1. `(size_h, size_w)` 是请求的窗口尺寸.
/// 2. `large` 是大样本规则, 满足时两个边长都改为规则中的值.
///
/// # 返回值
///
/// 裁剪后的体数据和实际窗口. 请求尺寸 (考虑大样本规则之后) 大于体数据时返回
/// `Err(GradingError::ShapeMismatch)`.
pub fn crop_center(
    volume: &Volume,
    (size_h, size_w): Idx2d,
    method: CropMethod,
    large: Option<LargeSample>,
) -> GradingResult<(Volume, CropWindow)> {
    let (_, h, w) = volume.shape();
    let (size_h, size_w) = match large {
        Some(rule) if h > rule.min_side && w > rule.min_side => {
            info!("large sample ({h}x{w}), crop size set to {}", rule.size);
            (rule.size, rule.size)
        }
        _ => (size_h, size_w),
    };
    if size_h == 0 || size_w == 0 || size_h > h || size_w > w {
        return Err(GradingError::ShapeMismatch(format!(
            "crop window {size_h}x{size_w} does not fit a {h}x{w} volume"
        )));
    }

    let center = match method {
        CropMethod::Moment => moment_center(volume),
        CropMethod::Mass => mass_center(volume),
    };
    let (ch, cw) = center.unwrap_or_else(|| {
        warn!("no sample found in projection, cropping around the geometric center");
        (h as f64 / 2.0, w as f64 / 2.0)
    });

    let rows = clamp_window(ch, size_h, h);
    let cols = clamp_window(cw, size_w, w);
    let window = CropWindow {
        h0: rows.start,
        h1: rows.end,
        w0: cols.start,
        w1: cols.end,
    };
    Ok((volume.crop_plane(rows, cols)?, window))
}

/// 在水平方向上各边去掉 `n` 个体素.
pub fn crop_border(volume: &Volume, n: usize) -> GradingResult<Volume> {
    let (_, h, w) = volume.shape();
    if 2 * n >= h || 2 * n >= w {
        return Err(GradingError::ShapeMismatch(format!(
            "border {n} leaves nothing of a {h}x{w} volume"
        )));
    }
    volume.crop_plane(n..h - n, n..w - n)
}

/// 将体数据切分为 `n × n` 个边长为 `tile`、间距为 `stride` 的子体.
///
/// 超出体数据范围的子体被丢弃. 返回每个子体的网格位置 `(i, j)`.
pub fn subvolumes(
    volume: &Volume,
    tile: usize,
    stride: usize,
    n: usize,
) -> GradingResult<Vec<(Idx2d, Volume)>> {
    let (_, h, w) = volume.shape();
    let mut ans = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            let (h0, w0) = (i * stride, j * stride);
            if h0 + tile > h || w0 + tile > w {
                continue;
            }
            ans.push(((i, j), volume.crop_plane(h0..h0 + tile, w0..w0 + tile)?));
        }
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// 在 `(z, 64, 80)` 的体数据中放置一个以 `(ch, cw)` 为中心的方块样本.
    fn block_sample(ch: usize, cw: usize, half: usize) -> Volume {
        Volume::new(Array3::from_shape_fn((10, 64, 80), |(_, h, w)| {
            let inside = h + half >= ch && h < ch + half && w + half >= cw && w < cw + half;
            if inside {
                180
            } else {
                5
            }
        }))
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("moment".parse::<CropMethod>().unwrap(), CropMethod::Moment);
        assert_eq!("MASS".parse::<CropMethod>().unwrap(), CropMethod::Mass);
        assert!(matches!(
            "median".parse::<CropMethod>(),
            Err(GradingError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_centers() {
        let v = block_sample(30, 40, 10);
        let (mh, mw) = moment_center(&v).unwrap();
        assert!((mh - 29.5).abs() < 1e-9 && (mw - 39.5).abs() < 1e-9);
        let (ch, cw) = mass_center(&v).unwrap();
        assert!((ch - 29.5).abs() < 1e-9 && (cw - 39.5).abs() < 1e-9);
    }

    /// 输出尺寸总是等于请求尺寸, 即使样本贴近边缘.
    #[test]
    fn test_crop_size_and_clamp() {
        for method in [CropMethod::Moment, CropMethod::Mass] {
            let v = block_sample(5, 75, 5);
            let (c, win) = crop_center(&v, (32, 32), method, None).unwrap();
            assert_eq!(c.slice_shape(), (32, 32));
            assert_eq!(win.size(), (32, 32));
            assert_eq!(win.h0, 0);
            assert_eq!(win.w1, 80);
        }
    }

    #[test]
    fn test_crop_window_centered() {
        let v = block_sample(30, 40, 10);
        let (c, win) = crop_center(&v, (20, 20), CropMethod::Moment, None).unwrap();
        assert_eq!(win, CropWindow { h0: 19, h1: 39, w0: 29, w1: 49 });
        assert!(c.data().iter().all(|p| *p == 180 || *p == 5));
    }

    #[test]
    fn test_crop_too_large() {
        let v = block_sample(30, 40, 10);
        assert!(matches!(
            crop_center(&v, (65, 20), CropMethod::Moment, None),
            Err(GradingError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_large_sample_rule() {
        let v = block_sample(30, 40, 10);
        let rule = LargeSample { min_side: 50, size: 60 };
        let (c, _) = crop_center(&v, (20, 20), CropMethod::Mass, Some(rule)).unwrap();
        assert_eq!(c.slice_shape(), (60, 60));
    }

    /// 常数体数据没有可识别的样本, 以几何中心裁剪.
    #[test]
    fn test_flat_volume_falls_back() {
        let v = Volume::new(Array3::from_elem((4, 20, 20), 50u8));
        let (_, win) = crop_center(&v, (10, 10), CropMethod::Moment, None).unwrap();
        assert_eq!(win, CropWindow { h0: 5, h1: 15, w0: 5, w1: 15 });
    }

    #[test]
    fn test_border_and_tiles() {
        let v = Volume::new(Array3::zeros((2, 30, 30)));
        assert_eq!(crop_border(&v, 4).unwrap().slice_shape(), (22, 22));
        assert!(crop_border(&v, 15).is_err());
        let tiles = subvolumes(&v, 10, 10, 3).unwrap();
        assert_eq!(tiles.len(), 9);
        let tiles = subvolumes(&v, 12, 10, 3).unwrap();
        assert_eq!(tiles.len(), 4);
        assert!(tiles.iter().all(|(_, t)| t.slice_shape() == (12, 12)));
    }
}
