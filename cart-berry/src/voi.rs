//! 软骨分区 VOI 提取.
//!
//! 输入是裁剪并翻转后 (表面在 `z = 0` 一侧) 的体数据及其界面掩膜.
//! 对每一列 `(h, w)`:
//!
//! 1. 表面位置是第一个灰度大于 Otsu 阈值的 `z`;
//! 2. 骨-软骨界面 (BCI) 位置是第一个掩膜为 `1` 的 `z`, 随后在合法列上做中值滤波;
//! 3. 三个区域的深度窗口为
//!   `surf = [s, s + surface)`,
//!   `deep = [b - offset - deep, b - offset)`,
//!   `calc = [b + offset, b + offset + calcified)`.
//!
//! 窗口越界或互相重叠的列不参与提取, 在输出中填零.

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, ArrayView3, Axis, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::VoiConfig;
use crate::consts::gray::MASK_FOREGROUND;
use crate::threshold::otsu_threshold_3d;
use crate::{GradingError, GradingResult, Mask, Volume, VoxelGrid};

/// 软骨分区.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Zone {
    /// 表层.
    Surf,
    /// 深层.
    Deep,
    /// 钙化层.
    Calc,
}

impl Zone {
    /// 全部分区, 按深度顺序排列.
    pub const ALL: [Zone; 3] = [Zone::Surf, Zone::Deep, Zone::Calc];

    /// 持久化时使用的名称.
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Zone::Surf => "surf",
            Zone::Deep => "deep",
            Zone::Calc => "calc",
        }
    }

    /// 由分级名称的前缀确定分区, 例如 `surf_sub` 属于表层.
    pub fn from_key(key: &str) -> GradingResult<Self> {
        let lower = key.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|z| lower.starts_with(z.name()))
            .ok_or_else(|| GradingError::UnsupportedMethod(format!("no zone for grade `{key}`")))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Zone {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_key(s)
    }
}

/// 深层 VOI 的深度.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum DeepDepth {
    /// 固定深度.
    Fixed(usize),
    /// 软骨平均厚度的给定比例.
    Auto(f64),
}

impl DeepDepth {
    /// 按软骨平均厚度 `thickness` 确定深度. 深度为零时返回
    /// [`GradingError::SegmentationFailure`].
    pub fn resolve(&self, thickness: f64) -> GradingResult<usize> {
        let depth = match *self {
            DeepDepth::Fixed(n) => n,
            DeepDepth::Auto(f) => (f * thickness).max(0.0) as usize,
        };
        if depth == 0 {
            return Err(GradingError::SegmentationFailure(format!(
                "deep zone depth is zero (cartilage thickness {thickness:.1})"
            )));
        }
        Ok(depth)
    }
}

/// 每一列上的表面与界面位置.
#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    /// 表面位置, 找不到时为 `None`.
    pub surface: Array2<Option<usize>>,
    /// 中值滤波后的界面位置, 找不到时为 `None`.
    pub bci: Array2<Option<usize>>,
    /// 体数据的三维 Otsu 阈值.
    pub otsu: f64,
}

impl Interface {
    /// 在掩膜和体数据上定位表面与界面.
    ///
    /// # 错误
    ///
    /// 1. 形状不一致时返回 [`GradingError::ShapeMismatch`].
    /// 2. 掩膜全零时返回 [`GradingError::SegmentationFailure`].
    pub fn locate(volume: &Volume, mask: &Mask, median: usize) -> GradingResult<Self> {
        mask.check_against(volume)?;
        if mask.is_empty() {
            return Err(GradingError::SegmentationFailure(
                "interface mask is empty".to_owned(),
            ));
        }
        let (_, otsu) = otsu_threshold_3d(volume.data());
        let surface = first_above(volume.data(), otsu);
        let bci = first_foreground(mask.data());
        let bci = median_filter(&bci, median);
        debug!("otsu threshold {otsu:.2}");
        Ok(Self { surface, bci, otsu })
    }

    /// 同时具有表面和界面, 且界面位于表面之下的列.
    fn columns(&self) -> impl Iterator<Item = ((usize, usize), usize, usize)> + '_ {
        self.surface
            .indexed_iter()
            .zip(self.bci.iter())
            .filter_map(|((idx, s), b)| match (*s, *b) {
                (Some(s), Some(b)) if b > s => Some((idx, s, b)),
                _ => None,
            })
    }

    /// 软骨平均厚度, 即合法列上 `bci - surface` 的平均值.
    pub fn thickness(&self) -> Option<f64> {
        let (sum, n) = self
            .columns()
            .fold((0usize, 0usize), |(sum, n), (_, s, b)| (sum + b - s, n + 1));
        (n > 0).then(|| sum as f64 / n as f64)
    }
}

/// 每列第一个灰度大于 `threshold` 的位置.
fn first_above(data: ArrayView3<'_, u8>, threshold: f64) -> Array2<Option<usize>> {
    Zip::from(data.lanes(Axis(0))).map_collect(|lane| lane.iter().position(|p| *p as f64 > threshold))
}

/// 每列第一个掩膜前景的位置.
fn first_foreground(data: ArrayView3<'_, u8>) -> Array2<Option<usize>> {
    Zip::from(data.lanes(Axis(0))).map_collect(|lane| lane.iter().position(|p| *p == MASK_FOREGROUND))
}

/// 对合法位置做 `size × size` 中值滤波, 窗口只统计合法的邻居,
/// 偶数个邻居时取较大的中位数. 非法位置保持 `None`.
pub fn median_filter(index: &Array2<Option<usize>>, size: usize) -> Array2<Option<usize>> {
    if size <= 1 {
        return index.clone();
    }
    let (rows, cols) = index.dim();
    let r = size / 2;
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        index[(i, j)]?;
        let window = index.slice(s![
            i.saturating_sub(r)..(i + r + 1).min(rows),
            j.saturating_sub(r)..(j + r + 1).min(cols)
        ]);
        let mut values: Vec<usize> = window.iter().flatten().copied().collect();
        values.sort_unstable();
        values.get(values.len() / 2).copied()
    })
}

/// 软骨平均厚度.
///
/// 没有任何一列同时找到表面和界面时返回 [`GradingError::SegmentationFailure`].
pub fn cartilage_depth(volume: &Volume, mask: &Mask, median: usize) -> GradingResult<f64> {
    Interface::locate(volume, mask, median)?
        .thickness()
        .ok_or_else(|| GradingError::SegmentationFailure("no column has both surface and interface".to_owned()))
}

/// 三个分区的 VOI, 均按 `(z, H, W)` 组织, 非法列为零.
#[derive(Clone, Debug)]
pub struct Vois {
    /// 表层.
    pub surf: Array3<u8>,
    /// 深层.
    pub deep: Array3<u8>,
    /// 钙化层.
    pub calc: Array3<u8>,
    /// 体数据的三维 Otsu 阈值.
    pub otsu: f64,
    /// 参与提取的列数.
    pub valid_columns: usize,
    /// 总列数.
    pub total_columns: usize,
}

impl Vois {
    /// 获取指定分区.
    #[inline]
    pub fn zone(&self, zone: Zone) -> ArrayView3<'_, u8> {
        match zone {
            Zone::Surf => self.surf.view(),
            Zone::Deep => self.deep.view(),
            Zone::Calc => self.calc.view(),
        }
    }
}

/// 提取三个分区的 VOI. 深层深度为 [`DeepDepth::Auto`] 时按软骨平均厚度确定.
///
/// # 错误
///
/// 1. 形状不一致时返回 [`GradingError::ShapeMismatch`].
/// 2. 掩膜全零、深层深度为零、或没有任何一列能容纳三个窗口时,
///   返回 [`GradingError::SegmentationFailure`].
pub fn extract_vois(volume: &Volume, mask: &Mask, config: &VoiConfig) -> GradingResult<Vois> {
    let interface = Interface::locate(volume, mask, config.median)?;
    let thickness = interface.thickness().ok_or_else(|| {
        GradingError::SegmentationFailure("no column has both surface and interface".to_owned())
    })?;
    let deep = config.deep.resolve(thickness)?;
    info!(
        "cartilage thickness {thickness:.1}, voi depths {}/{deep}/{}",
        config.surface, config.calcified
    );

    let depth = volume.len_z();
    let (h, w) = volume.slice_shape();
    let (surface, calcified, offset) = (config.surface, config.calcified, config.offset);
    let mut surf = Array3::zeros((surface, h, w));
    let mut deep_voi = Array3::zeros((deep, h, w));
    let mut calc = Array3::zeros((calcified, h, w));

    let data = volume.data();
    let mut valid = 0;
    for ((i, j), s, b) in interface.columns() {
        let Some(deep_start) = b.checked_sub(offset + deep) else {
            continue;
        };
        let calc_end = b + offset + calcified;
        if s + surface > deep_start || calc_end > depth {
            continue;
        }
        let lane = data.slice(s![.., i, j]);
        surf.slice_mut(s![.., i, j]).assign(&lane.slice(s![s..s + surface]));
        deep_voi
            .slice_mut(s![.., i, j])
            .assign(&lane.slice(s![deep_start..b - offset]));
        calc.slice_mut(s![.., i, j])
            .assign(&lane.slice(s![b + offset..calc_end]));
        valid += 1;
    }

    let total = h * w;
    if valid == 0 {
        return Err(GradingError::SegmentationFailure(format!(
            "none of {total} columns fits the voi windows"
        )));
    }
    if valid < total {
        warn!("{} of {total} columns excluded from voi extraction", total - valid);
    }
    Ok(Vois {
        surf,
        deep: deep_voi,
        calc,
        otsu: interface.otsu,
        valid_columns: valid,
        total_columns: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// 表面在 `z = 0` 一侧: 空气 `[0, 5)`, 软骨 `[5, 105)`, 骨 `[105, 170)`.
    fn sample(shape: (usize, usize)) -> (Volume, Mask) {
        let (h, w) = shape;
        let volume = Volume::new(Array3::from_shape_fn((170, h, w), |(z, _, _)| match z {
            0..=4 => 0,
            5..=104 => 150,
            _ => 200,
        }));
        let mask = Mask::new(Array3::from_shape_fn((170, h, w), |(z, _, _)| u8::from(z >= 105)))
            .unwrap();
        (volume, mask)
    }

    #[test]
    fn test_zone_from_key() {
        assert_eq!(Zone::from_key("surf_sub").unwrap(), Zone::Surf);
        assert_eq!(Zone::from_key("DeepCell").unwrap(), Zone::Deep);
        assert_eq!("calc".parse::<Zone>().unwrap(), Zone::Calc);
        assert!(Zone::from_key("total").is_err());
    }

    #[test]
    fn test_deep_depth() {
        assert_eq!(DeepDepth::Fixed(150).resolve(10.0).unwrap(), 150);
        assert_eq!(DeepDepth::Auto(0.6).resolve(40.0).unwrap(), 24);
        assert!(DeepDepth::Auto(0.6).resolve(1.0).is_err());
    }

    #[test]
    fn test_median_filter() {
        let mut index = Array2::from_elem((5, 5), Some(10usize));
        index[(2, 2)] = Some(90);
        index[(0, 0)] = None;
        let out = median_filter(&index, 5);
        assert_eq!(out[(2, 2)], Some(10));
        assert_eq!(out[(0, 0)], None);
        assert_eq!(median_filter(&index, 1), index);
    }

    #[test]
    fn test_cartilage_depth() {
        let (volume, mask) = sample((6, 6));
        assert_abs_diff_eq!(cartilage_depth(&volume, &mask, 5).unwrap(), 100.0);
    }

    #[test]
    fn test_extract_windows() {
        let (volume, mask) = sample((6, 6));
        let config = VoiConfig::default();
        let vois = extract_vois(&volume, &mask, &config).unwrap();
        // 厚度 100, 深层深度 60.
        assert_eq!(vois.surf.dim(), (25, 6, 6));
        assert_eq!(vois.deep.dim(), (60, 6, 6));
        assert_eq!(vois.calc.dim(), (50, 6, 6));
        assert_eq!(vois.valid_columns, 36);
        assert!(vois.surf.iter().all(|p| *p == 150));
        assert!(vois.deep.iter().all(|p| *p == 150));
        assert!(vois.calc.iter().all(|p| *p == 200));
        assert_eq!(vois.zone(Zone::Calc).dim(), (50, 6, 6));
    }

    /// 窗口不越界也不重叠, 否则该列填零.
    #[test]
    fn test_overlap_excluded() {
        let (volume, mask) = sample((4, 4));
        let mut raw = mask.into_raw();
        // 第一列界面上移到 z = 20, 表层窗口将与深层窗口重叠.
        raw.slice_mut(s![20..105, 0, 0]).fill(1);
        let mask = Mask::new(raw).unwrap();
        let config = VoiConfig {
            deep: DeepDepth::Fixed(10),
            median: 0,
            ..Default::default()
        };
        let vois = extract_vois(&volume, &mask, &config).unwrap();
        assert_eq!(vois.valid_columns, 15);
        assert!(vois.surf.slice(s![.., 0, 0]).iter().all(|p| *p == 0));
        assert!(vois.surf.slice(s![.., 1, 1]).iter().all(|p| *p == 150));

        // 钙化层超出体数据底部.
        let config = VoiConfig {
            calcified: 60,
            ..config
        };
        assert!(matches!(
            extract_vois(&volume, &mask, &config),
            Err(GradingError::SegmentationFailure(_))
        ));
    }

    #[test]
    fn test_degenerate_mask() {
        let (volume, _) = sample((4, 4));
        let empty = Mask::zeros(volume.shape());
        assert!(matches!(
            extract_vois(&volume, &empty, &VoiConfig::default()),
            Err(GradingError::SegmentationFailure(_))
        ));
        let wrong = Mask::zeros((10, 4, 4));
        assert!(matches!(
            cartilage_depth(&volume, &wrong, 5),
            Err(GradingError::ShapeMismatch(_))
        ));
    }
}
