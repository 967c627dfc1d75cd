//! 曲线拟合.
//!
//! 给定一系列点 `(x, y)`, 基于最小二乘法拟合多项式. 定向模块使用一次多项式
//! (直线) 描述包围盒中心随切片序号的漂移.

use ndarray::ArrayView1;

use crate::GradingResult;

mod polynomial;

pub use polynomial::Polynomial;

/// 基于最小二乘法拟合 `degree` 次多项式.
///
/// # 参数
///
/// 1. `x` 是自变量数组, `y` 是对应函数值, 二者长度必须相同.
/// 2. `degree` 是多项式次数, 最小为 1, 且点数必须多于 `degree`.
///
/// # 返回值
///
/// 参数不满足要求时返回 `Err(GradingError::ShapeMismatch)`,
/// 正规方程奇异时返回 `Err(GradingError::Linalg)`.
#[inline]
pub fn polynomial_fit(
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    degree: u32,
) -> GradingResult<Polynomial> {
    polynomial::fit(x, y, degree)
}

/// 拟合直线 `y = a + b x`, 返回斜率 `b`.
#[inline]
pub fn line_slope(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<f64> {
    Ok(polynomial::fit(x, y, 1)?.coefficients()[1])
}
