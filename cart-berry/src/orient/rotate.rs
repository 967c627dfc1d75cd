//! 平面内双线性旋转.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::data::par::map_indexed;

/// 角度小于该值 (度) 时不做旋转.
pub(crate) const ANGLE_EPS: f64 = 1e-6;

/// 双线性采样, 采样点落在图像外时返回 `0`.
#[inline]
fn bilinear(plane: ArrayView2<'_, u8>, a: f64, b: f64) -> f64 {
    let (rows, cols) = plane.dim();
    let (max_a, max_b) = ((rows - 1) as f64, (cols - 1) as f64);
    if !(0.0..=max_a).contains(&a) || !(0.0..=max_b).contains(&b) {
        return 0.0;
    }
    let (a0, b0) = (a.floor() as usize, b.floor() as usize);
    let (a1, b1) = ((a0 + 1).min(rows - 1), (b0 + 1).min(cols - 1));
    let (fa, fb) = (a - a0 as f64, b - b0 as f64);
    let p = |i: usize, j: usize| plane[(i, j)] as f64;
    let top = p(a0, b0) * (1.0 - fb) + p(a0, b1) * fb;
    let bottom = p(a1, b0) * (1.0 - fb) + p(a1, b1) * fb;
    top * (1.0 - fa) + bottom * fa
}

/// 将平面绕中心旋转, 使沿方向 `(cos θ, sin θ)` 的直线变为沿第一轴的直线.
///
/// 第一轴是深度方向. 输出与输入同形状, 结果四舍五入并截断到 `0..=255`.
pub(crate) fn rotate_plane(plane: ArrayView2<'_, u8>, theta: f64) -> Array2<u8> {
    let (rows, cols) = plane.dim();
    if rows == 0 || cols == 0 {
        return plane.to_owned();
    }
    let (ca, cb) = ((rows - 1) as f64 / 2.0, (cols - 1) as f64 / 2.0);
    let (sin, cos) = theta.sin_cos();
    Array2::from_shape_fn((rows, cols), |(qa, qb)| {
        let (da, db) = (qa as f64 - ca, qb as f64 - cb);
        let pa = ca + cos * da - sin * db;
        let pb = cb + sin * da + cos * db;
        bilinear(plane, pa, pb).round().clamp(0.0, 255.0) as u8
    })
}

/// 对 `axis` 方向上的每个平面做旋转, 各平面并行处理.
///
/// `axis` 只能是 `Axis(1)` 或 `Axis(2)`, 此时每个平面的第一轴都是深度方向.
pub(crate) fn rotate_planes(data: ArrayView3<'_, u8>, axis: Axis, degrees: f64) -> Array3<u8> {
    debug_assert!(axis == Axis(1) || axis == Axis(2));
    if degrees.abs() < ANGLE_EPS {
        return data.to_owned();
    }
    let theta = degrees.to_radians();
    let planes = map_indexed(data.len_of(axis), |i| {
        rotate_plane(data.index_axis(axis, i), theta)
    });
    let mut out = Array3::zeros(data.raw_dim());
    for (i, p) in planes.into_iter().enumerate() {
        out.index_axis_mut(axis, i).assign(&p);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_angle_is_identity() {
        let plane = Array2::from_shape_fn((7, 9), |(i, j)| (i * 9 + j) as u8);
        assert_eq!(rotate_plane(plane.view(), 0.0), plane);
    }

    /// 倾斜直线旋转后应当与深度方向平行.
    #[test]
    fn test_straighten_line() {
        let slope = 10f64.to_radians().tan();
        let (rows, cols) = (41, 41);
        let plane = Array2::from_shape_fn((rows, cols), |(z, w)| {
            let expected = 20.0 + slope * (z as f64 - 20.0);
            if (w as f64 - expected).abs() < 0.5 {
                255u8
            } else {
                0
            }
        });
        let out = rotate_plane(plane.view(), slope.atan());
        for z in 5..36 {
            let row = out.row(z);
            let (argmax, _) = row
                .iter()
                .enumerate()
                .max_by_key(|(_, v)| **v)
                .unwrap();
            assert!((19..=21).contains(&argmax), "row {z} peaks at {argmax}");
        }
    }

    #[test]
    fn test_rotate_planes_shape() {
        let data = Array3::from_elem((6, 4, 5), 9u8);
        let out = rotate_planes(data.view(), Axis(2), 15.0);
        assert_eq!(out.dim(), (6, 4, 5));
        // 中心体素始终在图像内部.
        assert_eq!(out[(3, 2, 2)], 9);
    }
}
