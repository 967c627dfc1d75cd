//! L2 正则化逻辑回归 (Newton 法).
//!
//! 最小化 `C · Σ logloss + ‖w‖² / 2`, 截距不参与正则化.

use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;

use super::{check_width, check_xy, Model};
use crate::{GradingError, GradingResult};

/// 梯度无穷范数小于该值时停止迭代.
const GRAD_TOL: f64 = 1e-8;

/// 加到 Hessian 对角线上的小量, 使截距方向也总是可解.
const HESSIAN_JITTER: f64 = 1e-10;

/// 数值稳定的 `ln(1 + e^z)`.
#[inline]
fn log1p_exp(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Logistic 函数.
#[inline]
pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// 逻辑回归分类器, 分级大于 `positive_above` 的样本为正类.
#[derive(Clone, Debug)]
pub struct Logistic {
    c: f64,
    fit_intercept: bool,
    positive_above: f64,
    max_iter: usize,
    coef: Array1<f64>,
    intercept: f64,
}

impl Logistic {
    /// 构造未拟合的模型.
    pub fn new(c: f64, fit_intercept: bool, positive_above: f64, max_iter: usize) -> Self {
        Self {
            c,
            fit_intercept,
            positive_above,
            max_iter,
            coef: Array1::zeros(0),
            intercept: 0.0,
        }
    }

    /// 目标函数值 (已除以 `C`).
    fn objective(&self, design: &Array2<f64>, t: &Array1<f64>, w: &Array1<f64>, penalty: &Array1<f64>) -> f64 {
        let z = design.dot(w);
        let loss: f64 = z.iter().zip(t).map(|(z, t)| log1p_exp(*z) - t * z).sum();
        loss + 0.5 * (w * w * penalty).sum()
    }
}

impl Model for Logistic {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()> {
        check_xy(x, y)?;
        if self.c.is_nan() || self.c <= 0.0 {
            return Err(GradingError::UnsupportedMethod(format!(
                "logistic regression with C = {}",
                self.c
            )));
        }
        let t = y.mapv(|v| if v > self.positive_above { 1.0 } else { 0.0 });
        let positives = t.sum();
        if positives == 0.0 || positives == t.len() as f64 {
            return Err(GradingError::UnsupportedMethod(format!(
                "logistic regression needs both classes, all grades on one side of {}",
                self.positive_above
            )));
        }

        let (n, p) = x.dim();
        let design = if self.fit_intercept {
            let mut d = Array2::ones((n, p + 1));
            d.slice_mut(s![.., ..p]).assign(&x);
            d
        } else {
            x.to_owned()
        };
        let q = design.ncols();
        let mut penalty = Array1::from_elem(q, 1.0 / self.c);
        if self.fit_intercept {
            penalty[p] = 0.0;
        }

        let mut w = Array1::<f64>::zeros(q);
        let mut iterations = 0;
        while iterations < self.max_iter {
            iterations += 1;
            let prob = design.dot(&w).mapv(sigmoid);
            let grad = design.t().dot(&(&prob - &t)) + &w * &penalty;
            if grad.iter().all(|g| g.abs() < GRAD_TOL) {
                break;
            }
            let curvature = prob.mapv(|p| p * (1.0 - p));
            let weighted = &design * &curvature.insert_axis(Axis(1));
            let mut hessian = design.t().dot(&weighted);
            for (i, pen) in penalty.iter().enumerate() {
                hessian[(i, i)] += pen + HESSIAN_JITTER;
            }
            let step = hessian.solve_into(grad.clone())?;

            // 回溯线搜索.
            let f0 = self.objective(&design, &t, &w, &penalty);
            let slope = grad.dot(&step);
            let mut lr = 1.0;
            let mut next = &w - &step;
            while self.objective(&design, &t, &next, &penalty) > f0 - 1e-4 * lr * slope && lr > 1e-10 {
                lr /= 2.0;
                next = &w - &(&step * lr);
            }
            w = next;
        }
        debug!("logistic regression converged after {iterations} newton steps");

        if self.fit_intercept {
            self.intercept = w[p];
            self.coef = w.slice_move(s![..p]);
        } else {
            self.intercept = 0.0;
            self.coef = w;
        }
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array1<f64>> {
        check_width(x, self.coef.len())?;
        Ok((x.dot(&self.coef) + self.intercept).mapv(sigmoid))
    }

    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coef.view()
    }

    fn intercept(&self) -> f64 {
        self.intercept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_sigmoid() {
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
        assert_abs_diff_eq!(sigmoid(800.0), 1.0);
        assert_abs_diff_eq!(sigmoid(-800.0), 0.0);
        assert_abs_diff_eq!(log1p_exp(0.0), 2f64.ln());
    }

    /// 在最优点处梯度为零: `Xᵀ(p - t) + w / C = 0`.
    #[test]
    fn test_stationary_point() {
        let x = array![[-2.0, 0.3], [-1.0, 0.1], [-0.5, -0.4], [0.5, 0.2], [1.0, -0.1], [2.0, 0.5]];
        let y = array![0.0, 1.0, 0.0, 2.0, 1.0, 3.0];
        let mut model = Logistic::new(1.0, false, 0.5, 100);
        model.fit(x.view(), y.view()).unwrap();
        let w = model.coefficients().to_owned();
        let t = y.mapv(|v| if v > 0.5 { 1.0 } else { 0.0 });
        let p = model.predict(x.view()).unwrap();
        let grad = x.t().dot(&(&p - &t)) + &w;
        for g in grad.iter() {
            assert_abs_diff_eq!(*g, 0.0, epsilon = 1e-6);
        }
        assert!(w[0] > 0.0);
        assert_eq!(model.intercept(), 0.0);
    }

    #[test]
    fn test_intercept_is_fitted() {
        let x = array![[0.0], [0.1], [0.2], [0.3], [0.4], [0.5]];
        let y = array![2.0, 2.0, 2.0, 2.0, 0.0, 2.0];
        let mut model = Logistic::new(1.0, true, 1.0, 100);
        model.fit(x.view(), y.view()).unwrap();
        assert!(model.intercept() > 0.0);
        let p = model.predict(x.view()).unwrap();
        assert!(p.iter().all(|v| *v > 0.5));
    }

    #[test]
    fn test_single_class_rejected() {
        let x = array![[0.0], [1.0]];
        let mut model = Logistic::new(1.0, true, 1.0, 100);
        assert!(matches!(
            model.fit(x.view(), array![0.0, 1.0].view()),
            Err(GradingError::UnsupportedMethod(_))
        ));
    }
}
