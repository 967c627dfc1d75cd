use std::ops::{Index, IndexMut, Range};

use ndarray::{s, Array3, ArrayView2, ArrayView3, ArrayViewMut3, Axis};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::gray::{is_mask_value, MASK_BACKGROUND, MASK_FOREGROUND};
use crate::{GradingError, GradingResult, Idx2d, Idx3d};

pub mod par;

/// 体数据与掩膜共用的形状属性和部分通用操作.
pub trait VoxelGrid {
    /// 获取底层三维数组.
    fn raw(&self) -> ArrayView3<'_, u8>;

    /// 获取数据形状 `(z, H, W)`.
    #[inline]
    fn shape(&self) -> Idx3d {
        self.raw().dim()
    }

    /// 获取数据水平切片形状大小.
    #[inline]
    fn slice_shape(&self) -> Idx2d {
        let (_, h, w) = self.shape();
        (h, w)
    }

    /// 获取水平切片个数, 即深度方向的长度.
    #[inline]
    fn len_z(&self) -> usize {
        self.shape().0
    }

    /// 获取数据体素个数. 由于体素类型为 `u8`, 这同时也是数据的字节数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取第 `z_index` 层切片视图. 越界时 panic.
    #[inline]
    fn slice_at(&self, z_index: usize) -> ArrayView2<'_, u8> {
        self.raw().index_axis_move(Axis(0), z_index)
    }
}

/// 检查 `[r.start, r.end)` 是否是长度为 `len` 的轴上非空的合法区间.
fn check_range(r: &Range<usize>, len: usize, axis: &str) -> GradingResult<()> {
    if r.start >= r.end || r.end > len {
        return Err(GradingError::ShapeMismatch(format!(
            "range {r:?} is invalid on {axis} axis of length {len}"
        )));
    }
    Ok(())
}

/// 8 位灰度 µCT 体数据, 按照 `(z, H, W)` 组织.
///
/// 所有几何变换 (裁剪, 翻转, 旋转) 都生成新的体数据.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<u8>,
}

impl VoxelGrid for Volume {
    #[inline]
    fn raw(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }
}

impl Index<Idx3d> for Volume {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for Volume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl From<Array3<u8>> for Volume {
    #[inline]
    fn from(data: Array3<u8>) -> Self {
        Self::new(data)
    }
}

impl Volume {
    /// 直接由三维数组创建体数据.
    #[inline]
    pub fn new(data: Array3<u8>) -> Self {
        Self { data }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, u8> {
        self.data.view_mut()
    }

    /// 取出底层数组.
    #[inline]
    pub fn into_raw(self) -> Array3<u8> {
        self.data
    }

    /// 获取能按升序迭代水平切片的迭代器.
    #[inline]
    pub fn slice_iter(&self) -> impl ExactSizeIterator<Item = ArrayView2<'_, u8>> {
        self.data.axis_iter(Axis(0))
    }

    /// 沿深度方向翻转, 使 `z = 0` 变为原来的最后一层.
    pub fn flip_depth(&self) -> Self {
        Self::new(self.data.slice(s![..;-1, .., ..]).to_owned())
    }

    /// 按照三个半开区间裁剪出子体. 任何区间为空或越界时返回
    /// `Err(GradingError::ShapeMismatch)`.
    pub fn crop(&self, z: Range<usize>, h: Range<usize>, w: Range<usize>) -> GradingResult<Self> {
        let (lz, lh, lw) = self.shape();
        check_range(&z, lz, "z")?;
        check_range(&h, lh, "height")?;
        check_range(&w, lw, "width")?;
        Ok(Self::new(
            self.data
                .slice(s![z.start..z.end, h.start..h.end, w.start..w.end])
                .to_owned(),
        ))
    }

    /// 只在水平方向上裁剪, 保留全部切片.
    #[inline]
    pub fn crop_plane(&self, h: Range<usize>, w: Range<usize>) -> GradingResult<Self> {
        self.crop(0..self.len_z(), h, w)
    }

    /// 将体数据与掩膜逐体素相乘, 仅保留掩膜前景.
    pub fn masked(&self, mask: &Mask) -> GradingResult<Self> {
        mask.check_against(self)?;
        Ok(Self::new(&self.data * &mask.data))
    }
}

/// 二值掩膜, 取值只能是 `0` 或 `1`, 与对应的体数据同形状.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: Array3<u8>,
}

impl VoxelGrid for Mask {
    #[inline]
    fn raw(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }
}

impl Index<Idx3d> for Mask {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl Mask {
    /// 由三维数组创建掩膜. 存在 `{0, 1}` 以外的值时返回
    /// `Err(GradingError::SegmentationFailure)`.
    pub fn new(data: Array3<u8>) -> GradingResult<Self> {
        if let Some(bad) = data.iter().find(|v| !is_mask_value(**v)) {
            return Err(GradingError::SegmentationFailure(format!(
                "mask contains non-binary value {bad}"
            )));
        }
        Ok(Self { data })
    }

    /// 由三维数组创建掩膜, 并检查其与 `volume` 同形状.
    pub fn for_volume(volume: &Volume, data: Array3<u8>) -> GradingResult<Self> {
        let mask = Self::new(data)?;
        mask.check_against(volume)?;
        Ok(mask)
    }

    /// 全背景掩膜.
    #[inline]
    pub fn zeros(shape: Idx3d) -> Self {
        Self {
            data: Array3::zeros(shape),
        }
    }

    /// 由布尔数组创建掩膜.
    #[inline]
    pub fn from_bool(data: &Array3<bool>) -> Self {
        Self {
            data: data.mapv(|b| if b { MASK_FOREGROUND } else { MASK_BACKGROUND }),
        }
    }

    /// 对概率图按 `threshold` 二值化, 严格大于阈值的体素为前景.
    #[inline]
    pub fn from_probability(prob: ArrayView3<'_, f32>, threshold: f32) -> Self {
        Self {
            data: prob.mapv(|p| u8::from(p > threshold)),
        }
    }

    /// 检查掩膜与体数据形状一致.
    pub fn check_against(&self, volume: &Volume) -> GradingResult<()> {
        if self.shape() != volume.shape() {
            return Err(GradingError::ShapeMismatch(format!(
                "mask shape {:?} differs from volume shape {:?}",
                self.shape(),
                volume.shape()
            )));
        }
        Ok(())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    /// 取出底层数组.
    #[inline]
    pub fn into_raw(self) -> Array3<u8> {
        self.data
    }

    /// 前景体素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v == MASK_FOREGROUND).count()
    }

    /// 掩膜是否全为背景?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|v| *v == MASK_BACKGROUND)
    }

    /// 沿深度方向翻转.
    pub fn flip_depth(&self) -> Self {
        Self {
            data: self.data.slice(s![..;-1, .., ..]).to_owned(),
        }
    }

    /// 只在水平方向上裁剪, 与 [`Volume::crop_plane`] 对应.
    pub fn crop_plane(&self, h: Range<usize>, w: Range<usize>) -> GradingResult<Self> {
        let (_, lh, lw) = self.shape();
        check_range(&h, lh, "height")?;
        check_range(&w, lw, "width")?;
        Ok(Self {
            data: self.data.slice(s![.., h.start..h.end, w.start..w.end]).to_owned(),
        })
    }
}

/// 切片上样本的包围盒, 覆盖列 `[left, right)` 与行 `[top, bottom)`.
///
/// 全零的包围盒代表该切片上没有找到足够大的样本区域.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingBox {
    /// 最左列.
    pub left: usize,
    /// 最右列的下一列.
    pub right: usize,
    /// 最上行.
    pub top: usize,
    /// 最下行的下一行.
    pub bottom: usize,
}

impl BoundingBox {
    /// 空包围盒.
    pub const EMPTY: Self = Self {
        left: 0,
        right: 0,
        top: 0,
        bottom: 0,
    };

    /// 包围盒是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// 包围盒中心 `(行, 列)`. 空包围盒返回 `None`.
    #[inline]
    pub fn center(&self) -> Option<(f64, f64)> {
        (!self.is_empty()).then(|| {
            (
                (self.top + self.bottom) as f64 / 2.0,
                (self.left + self.right) as f64 / 2.0,
            )
        })
    }

    /// 包围盒面积 (像素个数).
    #[inline]
    pub fn area(&self) -> usize {
        (self.right - self.left) * (self.bottom - self.top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp(shape: Idx3d) -> Volume {
        Volume::new(Array3::from_shape_fn(shape, |(z, h, w)| {
            (z * 100 + h * 10 + w) as u8
        }))
    }

    #[test]
    fn test_shape_attr() {
        let v = ramp((2, 3, 4));
        assert_eq!(v.shape(), (2, 3, 4));
        assert_eq!(v.slice_shape(), (3, 4));
        assert_eq!(v.len_z(), 2);
        assert_eq!(v.size(), 24);
        assert!(v.check(&(1, 2, 3)));
        assert!(!v.check(&(2, 0, 0)));
    }

    #[test]
    fn test_flip_depth() {
        let v = ramp((3, 2, 2));
        let f = v.flip_depth();
        assert_eq!(f[(0, 1, 1)], v[(2, 1, 1)]);
        assert_eq!(f[(2, 0, 1)], v[(0, 0, 1)]);
        assert_eq!(f.flip_depth(), v);
    }

    #[test]
    fn test_crop() {
        let v = ramp((3, 5, 5));
        let c = v.crop(1..3, 1..4, 2..5).unwrap();
        assert_eq!(c.shape(), (2, 3, 3));
        assert_eq!(c[(0, 0, 0)], v[(1, 1, 2)]);
        assert!(matches!(
            v.crop(0..3, 0..6, 0..5),
            Err(GradingError::ShapeMismatch(_))
        ));
        assert!(v.crop_plane(2..2, 0..5).is_err());
    }

    /// 掩膜构造器必须拒绝非二值数据和形状不一致的数据.
    #[test]
    fn test_mask_values_checked() {
        let v = ramp((2, 2, 2));
        assert!(Mask::new(Array3::from_elem((2, 2, 2), 2)).is_err());
        assert!(Mask::for_volume(&v, Array3::zeros((2, 2, 3))).is_err());
        let m = Mask::for_volume(&v, Array3::from_elem((2, 2, 2), 1)).unwrap();
        assert_eq!(m.count(), 8);
        assert!(!m.is_empty());
        assert!(Mask::zeros((2, 2, 2)).is_empty());
    }

    #[test]
    fn test_mask_from_probability() {
        let prob = Array3::from_shape_vec((1, 1, 3), vec![0.2f32, 0.5, 0.9]).unwrap();
        let m = Mask::from_probability(prob.view(), 0.5);
        assert_eq!(m.data().iter().copied().collect::<Vec<_>>(), vec![0, 0, 1]);
    }

    #[test]
    fn test_masked_volume() {
        let v = ramp((1, 2, 2));
        let mut raw = Array3::zeros((1, 2, 2));
        raw[(0, 1, 1)] = 1;
        let m = Mask::new(raw).unwrap();
        let out = v.masked(&m).unwrap();
        assert_eq!(out[(0, 0, 0)], 0);
        assert_eq!(out[(0, 1, 1)], v[(0, 1, 1)]);
    }

    #[test]
    fn test_bbox() {
        assert!(BoundingBox::default().is_empty());
        assert_eq!(BoundingBox::EMPTY.center(), None);
        let b = BoundingBox {
            left: 2,
            right: 6,
            top: 1,
            bottom: 3,
        };
        assert_eq!(b.center(), Some((2.0, 4.0)));
        assert_eq!(b.area(), 8);
    }
}
