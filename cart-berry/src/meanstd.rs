//! VOI 沿深度方向的均值/标准差投影.
//!
//! 每个 VOI 被压缩为两幅 `(H, W)` 图像, 二者之和 ([`MeanStd::combined`])
//! 是后续 PCA 使用的纹理特征.

use log::debug;
use ndarray::{s, Array2, ArrayView3, Axis, Zip};

use crate::voi::{Vois, Zone};

/// 表层深度超过该值时, 额外生成前后两半的投影.
pub const HALVES_MIN_SURFACE: usize = 25;

/// 单个 VOI 的投影.
#[derive(Clone, Debug, PartialEq)]
pub struct MeanStd {
    /// 逐列均值.
    pub mean: Array2<f64>,
    /// 逐列总体标准差.
    pub std: Array2<f64>,
}

impl MeanStd {
    /// 均值与标准差之和.
    #[inline]
    pub fn combined(&self) -> Array2<f64> {
        &self.mean + &self.std
    }
}

/// 沿深度方向 (`Axis(0)`) 计算均值和总体标准差.
///
/// 先求均值再求离差平方和, 所以常数列的标准差严格为 `0`.
/// 深度为零时两幅图像都为零.
pub fn mean_std(voi: ArrayView3<'_, u8>) -> MeanStd {
    let (depth, h, w) = voi.dim();
    if depth == 0 {
        return MeanStd {
            mean: Array2::zeros((h, w)),
            std: Array2::zeros((h, w)),
        };
    }
    let n = depth as f64;
    let mean = Zip::from(voi.lanes(Axis(0)))
        .map_collect(|lane| lane.iter().map(|p| *p as f64).sum::<f64>() / n);
    let std = Zip::from(voi.lanes(Axis(0)))
        .and(&mean)
        .map_collect(|lane, m| {
            let ss: f64 = lane.iter().map(|p| (*p as f64 - m).powi(2)).sum();
            (ss / n).sqrt()
        });
    MeanStd { mean, std }
}

/// 三个分区的特征图像 (即 [`MeanStd::combined`]).
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneImages {
    /// 表层.
    pub surf: Array2<f64>,
    /// 深层.
    pub deep: Array2<f64>,
    /// 钙化层.
    pub calc: Array2<f64>,
}

impl ZoneImages {
    /// 对三个 VOI 分别投影.
    pub fn from_vois(vois: &Vois) -> Self {
        Self {
            surf: mean_std(vois.surf.view()).combined(),
            deep: mean_std(vois.deep.view()).combined(),
            calc: mean_std(vois.calc.view()).combined(),
        }
    }

    /// 获取指定分区.
    #[inline]
    pub fn zone(&self, zone: Zone) -> &Array2<f64> {
        match zone {
            Zone::Surf => &self.surf,
            Zone::Deep => &self.deep,
            Zone::Calc => &self.calc,
        }
    }

    /// 按分区取得可变引用.
    #[inline]
    pub fn zone_mut(&mut self, zone: Zone) -> &mut Array2<f64> {
        match zone {
            Zone::Surf => &mut self.surf,
            Zone::Deep => &mut self.deep,
            Zone::Calc => &mut self.calc,
        }
    }
}

/// 表层与钙化层分别取前一半和后一半深度的投影, 深层保持不变.
///
/// 表层深度不超过 [`HALVES_MIN_SURFACE`] 时返回 `None`.
/// 返回值依次对应 `_25` 与 `_25_backup` 两组结果.
pub fn half_images(vois: &Vois) -> Option<(ZoneImages, ZoneImages)> {
    let surface = vois.surf.len_of(Axis(0));
    if surface <= HALVES_MIN_SURFACE {
        return None;
    }
    let (sh, ch) = (surface / 2, vois.calc.len_of(Axis(0)) / 2);
    debug!("splitting surface voi at {sh}, calcified voi at {ch}");
    let deep = mean_std(vois.deep.view()).combined();
    let first = ZoneImages {
        surf: mean_std(vois.surf.slice(s![..sh, .., ..])).combined(),
        deep: deep.clone(),
        calc: mean_std(vois.calc.slice(s![..ch, .., ..])).combined(),
    };
    let second = ZoneImages {
        surf: mean_std(vois.surf.slice(s![sh.., .., ..])).combined(),
        deep,
        calc: mean_std(vois.calc.slice(s![ch.., .., ..])).combined(),
    };
    Some((first, second))
}
