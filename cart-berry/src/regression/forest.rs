//! 随机森林二分类器.
//!
//! 每棵树在自助采样上生长, 每个节点随机选取 `⌊√p⌋` 个特征, 以 Gini 不纯度选择划分.
//! 预测值为各树叶节点正类比例的平均, 特征重要性为归一化的平均不纯度下降.

use log::debug;
use ndarray::{Array1, ArrayView1, ArrayView2};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use super::{check_width, check_xy, Model};
use crate::data::par::map_indexed;
use crate::{GradingError, GradingResult};

#[derive(Clone, Debug)]
enum Node {
    Leaf {
        positive: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// 单棵决策树, 节点按创建顺序存放, 根节点为 `0`.
#[derive(Clone, Debug)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut at = 0;
        loop {
            match self.nodes[at] {
                Node::Leaf { positive } => return positive,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if row[feature] <= threshold { left } else { right },
            }
        }
    }
}

/// 二分类 Gini 不纯度. `pos` 为正类个数, `n` 为总数.
#[inline]
fn gini(pos: f64, n: f64) -> f64 {
    if n == 0.0 {
        return 0.0;
    }
    let p = pos / n;
    2.0 * p * (1.0 - p)
}

/// 单棵树的生长过程.
struct Grower<'a, 'b> {
    x: ArrayView2<'a, f64>,
    t: &'b [f64],
    max_depth: Option<usize>,
    max_features: usize,
    rng: StdRng,
    nodes: Vec<Node>,
    importance: Vec<f64>,
}

impl Grower<'_, '_> {
    /// 在样本 `rows` (可重复) 上生长子树, 返回其根节点下标.
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let n = rows.len() as f64;
        let pos: f64 = rows.iter().map(|r| self.t[*r]).sum();
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            positive: if n > 0.0 { pos / n } else { 0.0 },
        });

        let pure = pos == 0.0 || pos == n;
        let deep_enough = self.max_depth.is_some_and(|d| depth >= d);
        if pure || deep_enough || rows.len() < 2 {
            return id;
        }
        let Some((feature, threshold, gain)) = self.best_split(&rows, pos) else {
            return id;
        };
        self.importance[feature] += gain;

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|r| self.x[(*r, feature)] <= threshold);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    /// 在随机特征子集上寻找不纯度下降最大的划分 `(特征, 阈值, 加权下降量)`.
    fn best_split(&mut self, rows: &[usize], pos: f64) -> Option<(usize, f64, f64)> {
        let n = rows.len() as f64;
        let parent = n * gini(pos, n);
        let p = self.x.ncols();
        let features = sample(&mut self.rng, p, self.max_features.min(p));

        let mut best: Option<(usize, f64, f64)> = None;
        for feature in features.iter() {
            let mut order: Vec<usize> = rows.to_vec();
            order.sort_by_key(|r| OrderedFloat(self.x[(*r, feature)]));
            let (mut left_n, mut left_pos) = (0.0, 0.0);
            for k in 0..order.len() - 1 {
                left_n += 1.0;
                left_pos += self.t[order[k]];
                let (a, b) = (self.x[(order[k], feature)], self.x[(order[k + 1], feature)]);
                if a == b {
                    continue;
                }
                let children = left_n * gini(left_pos, left_n)
                    + (n - left_n) * gini(pos - left_pos, n - left_n);
                let gain = parent - children;
                if gain > 0.0 && best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((feature, (a + b) / 2.0, gain));
                }
            }
        }
        best
    }
}

/// 随机森林分类器, 分级大于 `positive_above` 的样本为正类.
#[derive(Clone, Debug)]
pub struct RandomForest {
    n_trees: usize,
    max_depth: Option<usize>,
    seed: u64,
    positive_above: f64,
    trees: Vec<Tree>,
    importances: Array1<f64>,
}

impl RandomForest {
    /// 构造未拟合的模型.
    pub fn new(n_trees: usize, max_depth: Option<usize>, seed: u64, positive_above: f64) -> Self {
        Self {
            n_trees,
            max_depth,
            seed,
            positive_above,
            trees: vec![],
            importances: Array1::zeros(0),
        }
    }
}

impl Model for RandomForest {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> GradingResult<()> {
        check_xy(x, y)?;
        if self.n_trees == 0 {
            return Err(GradingError::UnsupportedMethod("random forest without trees".to_owned()));
        }
        let t: Vec<f64> = y
            .iter()
            .map(|v| if *v > self.positive_above { 1.0 } else { 0.0 })
            .collect();
        let (n, p) = x.dim();
        let max_features = ((p as f64).sqrt() as usize).max(1);

        // 每棵树的种子由主种子顺序生成, 与并行调度无关.
        let mut master = StdRng::seed_from_u64(self.seed);
        let seeds: Vec<u64> = (0..self.n_trees).map(|_| master.gen()).collect();

        let grown = map_indexed(self.n_trees, |i| {
            let mut rng = StdRng::seed_from_u64(seeds[i]);
            let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let mut grower = Grower {
                x,
                t: &t,
                max_depth: self.max_depth,
                max_features,
                rng,
                nodes: vec![],
                importance: vec![0.0; p],
            };
            grower.grow(rows, 0);
            (Tree { nodes: grower.nodes }, grower.importance)
        });

        let mut importances = Array1::<f64>::zeros(p);
        for (_, imp) in &grown {
            let total: f64 = imp.iter().sum();
            if total > 0.0 {
                importances += &(Array1::from(imp.clone()) / total);
            }
        }
        let total = importances.sum();
        if total > 0.0 {
            importances /= total;
        }
        self.trees = grown.into_iter().map(|(tree, _)| tree).collect();
        self.importances = importances;
        debug!(
            "random forest with {} trees, {} nodes in total",
            self.trees.len(),
            self.trees.iter().map(|t| t.nodes.len()).sum::<usize>()
        );
        Ok(())
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> GradingResult<Array1<f64>> {
        check_width(x, self.importances.len())?;
        if self.trees.is_empty() {
            return Err(GradingError::ShapeMismatch("random forest is not fitted".to_owned()));
        }
        let k = self.trees.len() as f64;
        Ok(x
            .rows()
            .into_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / k)
            .collect())
    }

    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.importances.view()
    }

    fn intercept(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    /// 第一个特征决定类别, 第二个特征是噪声.
    fn data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| {
            if j == 0 {
                i as f64
            } else {
                ((i * 7919) % 13) as f64
            }
        });
        let y = Array1::from_shape_fn(40, |i| if i >= 20 { 3.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn test_separable() {
        let (x, y) = data();
        let mut forest = RandomForest::new(25, Some(3), 42, 1.0);
        forest.fit(x.view(), y.view()).unwrap();
        let p = forest.predict(array![[2.0, 5.0], [37.0, 5.0]].view()).unwrap();
        assert!(p[0] < 0.5);
        assert!(p[1] > 0.5);

        let imp = forest.coefficients();
        assert_abs_diff_eq!(imp.sum(), 1.0, epsilon = 1e-12);
        assert!(imp[0] > imp[1]);
        assert_eq!(forest.intercept(), 0.0);
    }

    #[test]
    fn test_deterministic() {
        let (x, y) = data();
        let fit = || {
            let mut forest = RandomForest::new(10, None, 7, 1.0);
            forest.fit(x.view(), y.view()).unwrap();
            forest.predict(x.view()).unwrap()
        };
        assert_eq!(fit(), fit());
    }

    #[test]
    fn test_gini() {
        assert_abs_diff_eq!(gini(0.0, 4.0), 0.0);
        assert_abs_diff_eq!(gini(2.0, 4.0), 0.5);
        assert_abs_diff_eq!(gini(0.0, 0.0), 0.0);
    }
}
