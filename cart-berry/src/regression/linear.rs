//! 线性回归: ridge, lasso 与普通最小二乘.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{LeastSquaresSvd, Solve};

use super::{check_width, check_xy, Model};
use crate::GradingResult;

/// lasso 坐标下降的迭代上限.
const LASSO_MAX_ITER: usize = 1000;

/// lasso 坐标下降的相对收敛阈值.
const LASSO_TOL: f64 = 1e-6;

/// 预处理后的训练数据.
struct Centered {
    x: Array2<f64>,
    y: Array1<f64>,
    x_offset: Array1<f64>,
    x_scale: Array1<f64>,
    y_offset: f64,
}

impl Centered {
    /// 拟合截距时按列中心化, 此时若 `normalize` 再把各列缩放为单位 L2 范数.
    /// 不拟合截距时不做任何缩放.
    fn new(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>, fit_intercept: bool, normalize: bool) -> Self {
        let p = x.ncols();
        let (x_offset, y_offset) = match (fit_intercept, x.mean_axis(Axis(0)), y.mean()) {
            (true, Some(xm), Some(ym)) => (xm, ym),
            _ => (Array1::zeros(p), 0.0),
        };
        let mut xc = &x - &x_offset;
        let x_scale = if normalize && fit_intercept {
            xc.map_axis(Axis(0), |c| {
                let norm = c.dot(&c).sqrt();
                if norm > 0.0 {
                    norm
                } else {
                    1.0
                }
            })
        } else {
            Array1::ones(p)
        };
        xc /= &x_scale;
        Self {
            x: xc,
            y: &y - y_offset,
            x_offset,
            x_scale,
            y_offset,
        }
    }

    /// 将缩放空间中的权重还原为原始空间的系数和截距.
    fn finish(&self, w: Array1<f64>) -> (Array1<f64>, f64) {
        let coef = w / &self.x_scale;
        let intercept = self.y_offset - self.x_offset.dot(&coef);
        (coef, intercept)
    }
}

/// 线性模型的公共预测.
fn linear_predict(x: ArrayView2<'_, f64>, coef: &Array1<f64>, intercept: f64) -> GradingResult<Array1<f64>> {
    check_width(x, coef.len())?;
    Ok(x.dot(coef) + intercept)
}

/// L2 正则化线性回归, 最小化 `‖y - Xw‖² + α‖w‖²`.
#[derive(Clone, Debug)]
pub struct Ridge {
    alpha: f64,
    fit_intercept: bool,
    normalize: bool,
    coef: Array1<f64>,
    intercept: f64,
}

impl Ridge {
    /// 构造未拟合的模型.
    pub fn new(alpha: f64, fit_intercept: bool, normalize: bool) -> Self {
        Self {
            alpha,
            fit_intercept,
            normalize,
            coef: Array1::zeros(0),
            intercept: 0.0,
        }
    }
}

impl Model for Ridge {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()> {
        check_xy(x, y)?;
        let data = Centered::new(x, y, self.fit_intercept, self.normalize);
        let (n, p) = data.x.dim();
        // 特征多于样本时在对偶空间求解.
        let w = if p <= n {
            let gram = data.x.t().dot(&data.x) + Array2::<f64>::eye(p) * self.alpha;
            gram.solve_into(data.x.t().dot(&data.y))?
        } else {
            let kernel = data.x.dot(&data.x.t()) + Array2::<f64>::eye(n) * self.alpha;
            data.x.t().dot(&kernel.solve_into(data.y.clone())?)
        };
        (self.coef, self.intercept) = data.finish(w);
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array1<f64>> {
        linear_predict(x, &self.coef, self.intercept)
    }

    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coef.view()
    }

    fn intercept(&self) -> f64 {
        self.intercept
    }
}

/// 软阈值.
#[inline]
fn soft_threshold(v: f64, t: f64) -> f64 {
    if v > t {
        v - t
    } else if v < -t {
        v + t
    } else {
        0.0
    }
}

/// L1 正则化线性回归, 最小化 `‖y - Xw‖² / (2n) + α‖w‖₁`, 使用循环坐标下降.
#[derive(Clone, Debug)]
pub struct Lasso {
    alpha: f64,
    fit_intercept: bool,
    normalize: bool,
    coef: Array1<f64>,
    intercept: f64,
}

impl Lasso {
    /// 构造未拟合的模型.
    pub fn new(alpha: f64, fit_intercept: bool, normalize: bool) -> Self {
        Self {
            alpha,
            fit_intercept,
            normalize,
            coef: Array1::zeros(0),
            intercept: 0.0,
        }
    }
}

impl Model for Lasso {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()> {
        check_xy(x, y)?;
        let data = Centered::new(x, y, self.fit_intercept, self.normalize);
        let (n, p) = data.x.dim();
        let col_sq: Vec<f64> = data.x.columns().into_iter().map(|c| c.dot(&c)).collect();
        let penalty = self.alpha * n as f64;

        let mut w = Array1::<f64>::zeros(p);
        let mut residual = data.y.clone();
        for _ in 0..LASSO_MAX_ITER {
            let (mut max_delta, mut max_w) = (0.0f64, 0.0f64);
            for j in 0..p {
                if col_sq[j] == 0.0 {
                    continue;
                }
                let xj = data.x.column(j);
                let old = w[j];
                let rho = xj.dot(&residual) + col_sq[j] * old;
                let new = soft_threshold(rho, penalty) / col_sq[j];
                if new != old {
                    residual.scaled_add(old - new, &xj);
                    w[j] = new;
                }
                max_delta = max_delta.max((new - old).abs());
                max_w = max_w.max(new.abs());
            }
            if max_w == 0.0 || max_delta <= LASSO_TOL * max_w {
                break;
            }
        }
        (self.coef, self.intercept) = data.finish(w);
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array1<f64>> {
        linear_predict(x, &self.coef, self.intercept)
    }

    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coef.view()
    }

    fn intercept(&self) -> f64 {
        self.intercept
    }
}

/// 普通最小二乘, 通过 SVD 求最小范数解.
#[derive(Clone, Debug)]
pub struct Linear {
    fit_intercept: bool,
    coef: Array1<f64>,
    intercept: f64,
}

impl Linear {
    /// 构造未拟合的模型.
    pub fn new(fit_intercept: bool) -> Self {
        Self {
            fit_intercept,
            coef: Array1::zeros(0),
            intercept: 0.0,
        }
    }
}

impl Model for Linear {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()> {
        check_xy(x, y)?;
        let data = Centered::new(x, y, self.fit_intercept, false);
        let w = data.x.least_squares(&data.y)?.solution;
        (self.coef, self.intercept) = data.finish(w);
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array1<f64>> {
        linear_predict(x, &self.coef, self.intercept)
    }

    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coef.view()
    }

    fn intercept(&self) -> f64 {
        self.intercept
    }
}
