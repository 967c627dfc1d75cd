//! 多项式曲线.

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Inverse;

use crate::{GradingError, GradingResult};

/// 多项式, 系数按次数升序存放.
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial(Array1<f64>);

impl Polynomial {
    /// 系数, 第 `i` 项对应 `x^i`.
    #[inline]
    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }

    /// 多项式次数.
    #[inline]
    pub fn degree(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    /// Horner 求值.
    pub fn eval(&self, x: f64) -> f64 {
        self.0.iter().rev().fold(0.0, |acc, &cur| acc * x + cur)
    }
}

/// 范德蒙德矩阵, 形状 `(x.len(), degree + 1)`.
fn vandermonde(x: ArrayView1<'_, f64>, degree: u32) -> Array2<f64> {
    Array2::from_shape_fn((x.len(), degree as usize + 1), |(m, n)| x[m].powi(n as i32))
}

pub(super) fn fit(
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    degree: u32,
) -> GradingResult<Polynomial> {
    if x.len() != y.len() {
        return Err(GradingError::ShapeMismatch(format!(
            "{} abscissae but {} ordinates",
            x.len(),
            y.len()
        )));
    }
    if degree == 0 || x.len() <= degree as usize {
        return Err(GradingError::ShapeMismatch(format!(
            "cannot fit degree {degree} through {} points",
            x.len()
        )));
    }

    // theta = (V^T V)^-1 V^T y
    let v_mat = vandermonde(x, degree);
    let theta = v_mat.t().dot(&v_mat).inv()?.dot(&v_mat.t()).dot(&y);
    debug_assert_eq!(theta.len(), degree as usize + 1);
    Ok(Polynomial(theta))
}
