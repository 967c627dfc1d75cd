//! 二值化、连通区域与二维形态学.
//!
//! 该模块只处理单通道 8 位图像, 以及由它们得到的布尔平面.

use std::collections::VecDeque;
use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, ArrayView3, Axis, Zip};

use crate::data::par::map_indexed;
use crate::{Area2d, Areas2d, BoundingBox, GradingError, GradingResult, Idx2d, Mask};

/// 灰度直方图.
pub type Histogram = [u64; 256];

/// 连通规则.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Connectivity {
    /// 4-邻域.
    Four,
    /// 8-邻域.
    Eight,
}

const N4: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

const N8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// 获得 `pos` 在 `shape` 范围内的邻居. 保证返回的索引都不越界.
fn neighbours(
    (r, c): Idx2d,
    (h, w): Idx2d,
    connectivity: Connectivity,
) -> impl Iterator<Item = Idx2d> {
    let offsets: &'static [(isize, isize)] = match connectivity {
        Connectivity::Four => &N4,
        Connectivity::Eight => &N8,
    };
    offsets.iter().filter_map(move |&(dr, dc)| {
        let nr = r.checked_add_signed(dr)?;
        let nc = c.checked_add_signed(dc)?;
        (nr < h && nc < w).then_some((nr, nc))
    })
}

/// 统计直方图.
pub fn histogram<'a, I: IntoIterator<Item = &'a u8>>(values: I) -> Histogram {
    let mut hist = [0u64; 256];
    for &v in values {
        hist[v as usize] += 1;
    }
    hist
}

/// 由直方图计算 Otsu 阈值. 严格大于阈值的像素为前景.
///
/// 直方图为空或只有一种灰度时返回 `0`.
pub fn otsu_from_histogram(hist: &Histogram) -> u8 {
    let total: f64 = hist.iter().map(|c| *c as f64).sum();
    let sum: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, c)| i as f64 * *c as f64)
        .sum();

    let mut sum_b = 0.0;
    let mut weight_b = 0.0;
    let mut max_variance = 0.0;
    let mut threshold = 0u8;

    for (i, &count) in hist.iter().enumerate() {
        weight_b += count as f64;
        if weight_b == 0.0 {
            continue;
        }
        let weight_f = total - weight_b;
        if weight_f == 0.0 {
            break;
        }
        sum_b += i as f64 * count as f64;
        let mean_b = sum_b / weight_b;
        let mean_f = (sum - sum_b) / weight_f;
        let variance = weight_b * weight_f * (mean_b - mean_f).powi(2);
        if variance > max_variance {
            max_variance = variance;
            threshold = i as u8;
        }
    }
    threshold
}

/// 计算一组像素的 Otsu 阈值.
#[inline]
pub fn otsu_threshold<'a, I: IntoIterator<Item = &'a u8>>(values: I) -> u8 {
    otsu_from_histogram(&histogram(values))
}

/// 三维 Otsu 阈值.
///
/// 分别对每个 `H` 平面 (`(z, W)` 切面) 和每个 `W` 平面 (`(z, H)` 切面)
/// 计算 Otsu 阈值, 两组阈值各自取平均后再取平均. 返回 `data > value`
/// 的掩膜和阈值本身.
pub fn otsu_threshold_3d(data: ArrayView3<'_, u8>) -> (Mask, f64) {
    let (_, h, w) = data.dim();
    if data.is_empty() {
        return (Mask::zeros(data.dim()), 0.0);
    }
    let along_h = map_indexed(h, |i| otsu_threshold(data.index_axis(Axis(1), i)) as f64);
    let along_w = map_indexed(w, |i| otsu_threshold(data.index_axis(Axis(2), i)) as f64);
    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    let value = (mean(&along_h) + mean(&along_w)) / 2.0;
    let mask = Mask::from_bool(&data.mapv(|p| p as f64 > value));
    (mask, value)
}

/// 获取布尔平面上的全部前景连通区域. 区域按照其第一个像素的行优先顺序排列.
pub fn connected_components(plane: ArrayView2<'_, bool>, connectivity: Connectivity) -> Areas2d {
    let shape = plane.dim();
    let mut visited = Array2::from_elem(shape, false);
    let mut ans = Areas2d::new();
    let mut bfs_q = VecDeque::with_capacity(16);

    for (pos, &fg) in plane.indexed_iter() {
        if !fg || visited[pos] {
            continue;
        }
        visited[pos] = true;
        bfs_q.push_back(pos);
        let mut this_area = Area2d::with_capacity(1);
        while let Some(cur) = bfs_q.pop_front() {
            this_area.push(cur);
            for nb in neighbours(cur, shape, connectivity) {
                if plane[nb] && !visited[nb] {
                    visited[nb] = true;
                    bfs_q.push_back(nb);
                }
            }
        }
        ans.push(this_area);
    }
    ans
}

/// 像素数最多的区域. 数目相同时取先出现者.
pub fn largest_component(areas: &[Area2d]) -> Option<&Area2d> {
    areas.iter().fold(None, |best: Option<&Area2d>, a| match best {
        Some(b) if b.len() >= a.len() => Some(b),
        _ => Some(a),
    })
}

/// 区域的外接矩形. 空区域返回空包围盒.
pub fn bounding_rect(area: &[Idx2d]) -> BoundingBox {
    let Some(&(r0, c0)) = area.first() else {
        return BoundingBox::EMPTY;
    };
    let init = (r0, r0, c0, c0);
    let (top, bottom, left, right) = area.iter().fold(init, |(t, b, l, r), &(y, x)| {
        (t.min(y), b.max(y), l.min(x), r.max(x))
    });
    BoundingBox {
        left,
        right: right + 1,
        top,
        bottom: bottom + 1,
    }
}

/// 将区域绘制为布尔平面.
pub fn area_to_plane(area: &[Idx2d], shape: Idx2d) -> Array2<bool> {
    let mut plane = Array2::from_elem(shape, false);
    for &p in area {
        plane[p] = true;
    }
    plane
}

/// 切片样本的包围盒.
///
/// 以 `threshold` 二值化 (严格大于为前景) 后, 在所有 8-连通区域中选择外接矩形
/// 面积最大者. 若该面积不超过 `min_area`, 返回空包围盒.
pub fn bounding_box(slice: ArrayView2<'_, u8>, threshold: u8, min_area: usize) -> BoundingBox {
    let fg = slice.mapv(|p| p > threshold);
    let best = connected_components(fg.view(), Connectivity::Eight)
        .iter()
        .map(|a| bounding_rect(a))
        .fold(BoundingBox::EMPTY, |best, b| {
            if b.area() > best.area() {
                b
            } else {
                best
            }
        });
    if best.area() > min_area {
        best
    } else {
        BoundingBox::EMPTY
    }
}

/// 填充前景中的孔洞: 所有无法经 4-邻域背景路径到达图像边缘的背景像素都变为前景.
pub fn fill_holes(plane: ArrayView2<'_, bool>) -> Array2<bool> {
    let (h, w) = plane.dim();
    let mut outside = Array2::from_elem((h, w), false);
    let mut bfs_q: VecDeque<Idx2d> = plane
        .indexed_iter()
        .filter_map(|((r, c), &fg)| {
            let at_border = r == 0 || c == 0 || r + 1 == h || c + 1 == w;
            (at_border && !fg).then_some((r, c))
        })
        .collect();
    for &p in bfs_q.iter() {
        outside[p] = true;
    }
    while let Some(cur) = bfs_q.pop_front() {
        for nb in neighbours(cur, (h, w), Connectivity::Four) {
            if !plane[nb] && !outside[nb] {
                outside[nb] = true;
                bfs_q.push_back(nb);
            }
        }
    }
    outside.mapv(|o| !o)
}

fn reduce_window<I: Iterator<Item = bool>>(mut it: I, dilate: bool) -> bool {
    if dilate {
        it.any(|v| v)
    } else {
        it.all(|v| v)
    }
}

/// 方形结构元的膨胀 (`dilate = true`) 或腐蚀. 结构元超出图像的部分被忽略,
/// 因此腐蚀不会从图像边缘向内侵蚀.
fn square_morph(plane: ArrayView2<'_, bool>, size: usize, dilate: bool) -> Array2<bool> {
    let r = size / 2;
    let (h, w) = plane.dim();
    // 可分离: 先行后列.
    let rows = Array2::from_shape_fn((h, w), |(i, j)| {
        let span = j.saturating_sub(r)..(j + r + 1).min(w);
        reduce_window(span.map(|k| plane[(i, k)]), dilate)
    });
    Array2::from_shape_fn((h, w), |(i, j)| {
        let span = i.saturating_sub(r)..(i + r + 1).min(h);
        reduce_window(span.map(|k| rows[(k, j)]), dilate)
    })
}

/// 方形结构元膨胀.
#[inline]
pub fn dilate_square(plane: ArrayView2<'_, bool>, size: usize) -> Array2<bool> {
    square_morph(plane, size, true)
}

/// 方形结构元腐蚀.
#[inline]
pub fn erode_square(plane: ArrayView2<'_, bool>, size: usize) -> Array2<bool> {
    square_morph(plane, size, false)
}

/// 方形结构元闭运算 (先膨胀后腐蚀).
#[inline]
pub fn close_square(plane: ArrayView2<'_, bool>, size: usize) -> Array2<bool> {
    erode_square(dilate_square(plane, size).view(), size)
}

/// 局部均值自适应阈值. 像素严格大于 `block × block` 邻域均值减 `c` 时为前景.
/// 邻域超出图像的部分被忽略.
pub fn adaptive_mean_threshold(image: ArrayView2<'_, u8>, block: usize, c: f64) -> Array2<bool> {
    let (h, w) = image.dim();
    let r = block / 2;

    // 积分图, 多一行一列零.
    let mut integral = Array2::<u64>::zeros((h + 1, w + 1));
    for i in 0..h {
        let mut row_sum = 0u64;
        for j in 0..w {
            row_sum += image[(i, j)] as u64;
            integral[(i + 1, j + 1)] = integral[(i, j + 1)] + row_sum;
        }
    }

    Array2::from_shape_fn((h, w), |(i, j)| {
        let (i0, i1) = (i.saturating_sub(r), (i + r + 1).min(h));
        let (j0, j1) = (j.saturating_sub(r), (j + r + 1).min(w));
        let sum = integral[(i1, j1)] + integral[(i0, j0)] - integral[(i0, j1)] - integral[(i1, j0)];
        let mean = sum as f64 / ((i1 - i0) * (j1 - j0)) as f64;
        image[(i, j)] as f64 > mean - c
    })
}

/// 检测并裁掉投影图像某个角上不属于样本的伪影.
///
/// 自适应阈值后填充最大的前景区域, 经 7×7 闭运算, 剩下的部分中最大的区域视为伪影.
/// 若伪影的外接矩形贴住图像的某个角, 且裁掉它之后剩余面积仍大于原图一半,
/// 则返回裁剪后的图像和 `true`; 否则原样返回图像和 `false`.
///
/// # 注意
///
/// 表层投影上的纹理可能被误认为伪影, 建议仅用于深层和钙化层.
pub fn auto_corner_crop(image: ArrayView2<'_, f64>) -> (Array2<f64>, bool) {
    let dim = image.dim();
    let gray = image.mapv(|v| v.clamp(0.0, 255.0) as u8);
    let adaptive = adaptive_mean_threshold(gray.view(), 11, 2.0);
    let areas = connected_components(adaptive.view(), Connectivity::Eight);
    let Some(largest) = largest_component(&areas) else {
        return (image.to_owned(), false);
    };

    let mut filled = fill_holes(area_to_plane(largest, dim).view());
    Zip::from(&mut filled)
        .and(&gray)
        .for_each(|f, &g| *f |= g == u8::MAX);
    let corners = close_square(filled.view(), 7).mapv(|v| !v);

    let artefacts = connected_components(corners.view(), Connectivity::Eight);
    let Some(artefact) = largest_component(&artefacts) else {
        return (image.to_owned(), false);
    };
    let rect = bounding_rect(artefact);
    let (x, y) = (rect.left, rect.top);
    let (aw, ah) = (rect.right - rect.left, rect.bottom - rect.top);
    let (rows, cols) = dim;

    let window: Option<(Range<usize>, Range<usize>)> = if x == 0 {
        if y == 0 {
            Some((ah..rows, aw..cols))
        } else if y + ah == rows {
            Some((0..rows - ah, aw..cols))
        } else {
            None
        }
    } else if x + aw == cols {
        if y == 0 {
            Some((ah..rows, 0..cols - aw))
        } else if y + ah == rows {
            Some((0..rows - ah, 0..cols - aw))
        } else {
            None
        }
    } else {
        None
    };

    match window {
        Some((r, c)) if 2 * r.len() * c.len() > rows * cols => {
            (image.slice(s![r, c]).to_owned(), true)
        }
        _ => (image.to_owned(), false),
    }
}

/// 将图像切分为 `n_x × n_y` 个等间距的 `size_x × size_y` 子图, 行优先排列.
///
/// 子图尺寸大于图像时返回 `Err(GradingError::ShapeMismatch)`.
pub fn create_subimages(
    image: ArrayView2<'_, f64>,
    (n_x, n_y): Idx2d,
    (size_x, size_y): Idx2d,
) -> GradingResult<Vec<Array2<f64>>> {
    let (h, w) = image.dim();
    if size_x > h || size_y > w || n_x == 0 || n_y == 0 {
        return Err(GradingError::ShapeMismatch(format!(
            "cannot tile {n_x}x{n_y} subimages of {size_x}x{size_y} from {h}x{w}"
        )));
    }
    let (step_x, step_y) = ((h - size_x) / n_x, (w - size_y) / n_y);
    let mut ans = Vec::with_capacity(n_x * n_y);
    for i in 0..n_x {
        for j in 0..n_y {
            let (x0, y0) = (step_x * i, step_y * j);
            ans.push(image.slice(s![x0..x0 + size_x, y0..y0 + size_y]).to_owned());
        }
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VoxelGrid;
    use ndarray::{Array2, Array3};

    #[test]
    fn test_otsu_two_levels() {
        let mut v = vec![20u8; 50];
        v.extend(vec![200u8; 50]);
        let t = otsu_threshold(&v);
        assert!((20..200).contains(&t));
    }

    /// 单一灰度或空输入时阈值退化为 0.
    #[test]
    fn test_otsu_degenerate() {
        assert_eq!(otsu_threshold(&[7u8; 10]), 0);
        assert_eq!(otsu_threshold(&[] as &[u8]), 0);
    }

    #[test]
    fn test_otsu_3d() {
        // 上半部分暗, 下半部分亮.
        let data = Array3::from_shape_fn((10, 4, 4), |(z, _, _)| if z < 5 { 10u8 } else { 180 });
        let (mask, value) = otsu_threshold_3d(data.view());
        assert!((10.0..180.0).contains(&value));
        assert_eq!(mask.count(), 5 * 4 * 4);
        assert_eq!(mask[(0, 0, 0)], 0);
        assert_eq!(mask[(9, 3, 3)], 1);
        assert_eq!(mask.shape(), (10, 4, 4));
    }

    #[test]
    fn test_components() {
        let mut p = Array2::from_elem((5, 5), false);
        p[(0, 0)] = true;
        p[(1, 1)] = true;
        p[(4, 4)] = true;
        p[(4, 3)] = true;
        p[(3, 3)] = true;
        let four = connected_components(p.view(), Connectivity::Four);
        assert_eq!(four.len(), 3);
        let eight = connected_components(p.view(), Connectivity::Eight);
        assert_eq!(eight.len(), 2);
        assert_eq!(largest_component(&eight).unwrap().len(), 3);
        let rect = bounding_rect(largest_component(&eight).unwrap());
        assert_eq!(
            rect,
            BoundingBox {
                left: 3,
                right: 5,
                top: 3,
                bottom: 5
            }
        );
    }

    #[test]
    fn test_bounding_box() {
        let mut slice = Array2::<u8>::zeros((100, 100));
        slice.slice_mut(s![10..60, 20..70]).fill(200);
        // 小噪点.
        slice.slice_mut(s![90..92, 90..92]).fill(255);
        let b = bounding_box(slice.view(), 80, 1600);
        assert_eq!(
            b,
            BoundingBox {
                left: 20,
                right: 70,
                top: 10,
                bottom: 60
            }
        );
        // 面积不足时返回空包围盒.
        assert!(bounding_box(slice.view(), 80, 2500).is_empty());
        assert!(bounding_box(Array2::zeros((8, 8)).view(), 80, 0).is_empty());
    }

    #[test]
    fn test_fill_holes() {
        let mut p = Array2::from_elem((5, 5), false);
        p.slice_mut(s![1..4, 1..4]).fill(true);
        p[(2, 2)] = false;
        let f = fill_holes(p.view());
        assert!(f[(2, 2)]);
        assert!(!f[(0, 0)]);
        assert_eq!(f.iter().filter(|v| **v).count(), 9);
    }

    #[test]
    fn test_closing_fills_gap() {
        let mut p = Array2::from_elem((9, 9), true);
        p[(4, 4)] = false;
        let c = close_square(p.view(), 3);
        assert!(c.iter().all(|v| *v));
        let e = erode_square(p.view(), 3);
        assert!(!e[(3, 3)]);
        assert!(e[(0, 0)]);
    }

    #[test]
    fn test_adaptive_constant_image() {
        let img = Array2::from_elem((20, 20), 100u8);
        assert!(adaptive_mean_threshold(img.view(), 11, 2.0).iter().all(|v| *v));
    }

    #[test]
    fn test_auto_corner_crop() {
        let mut img = Array2::from_elem((40, 40), 200.0);
        img.slice_mut(s![0..10, 0..10]).fill(0.0);
        let (out, cropped) = auto_corner_crop(img.view());
        assert!(cropped);
        assert_eq!(out.dim(), (30, 30));
        assert!(out.iter().all(|v| *v == 200.0));

        // 无伪影时原样返回.
        let flat = Array2::from_elem((40, 40), 120.0);
        let (out, cropped) = auto_corner_crop(flat.view());
        assert!(!cropped);
        assert_eq!(out, flat);
    }

    #[test]
    fn test_subimages() {
        let img = Array2::from_shape_fn((10, 12), |(i, j)| (i * 12 + j) as f64);
        let subs = create_subimages(img.view(), (2, 3), (4, 6)).unwrap();
        assert_eq!(subs.len(), 6);
        assert!(subs.iter().all(|s| s.dim() == (4, 6)));
        // 第二行第一个子图起始于 (3, 0).
        assert_eq!(subs[3][(0, 0)], img[(3, 0)]);
        assert!(create_subimages(img.view(), (1, 1), (11, 4)).is_err());
    }
}
