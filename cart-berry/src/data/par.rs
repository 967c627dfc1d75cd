//! 按索引有序的并行映射.
//!
//! 启用 `rayon` 特性时在线程池中并行执行, 否则顺序执行. 无论哪种方式,
//! 结果总是按照输入索引的升序排列.

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

use crate::GradingResult;

/// 对 `0..n` 中的每个索引调用 `f`, 结果按索引顺序收集.
pub fn map_indexed<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            (0..n).into_par_iter().map(f).collect()
        } else {
            (0..n).map(f).collect()
        }
    }
}

/// 与 [`map_indexed`] 相同, 但 `f` 可能失败. 任何一个索引失败则整体失败.
pub fn try_map_indexed<T, F>(n: usize, f: F) -> GradingResult<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> GradingResult<T> + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            (0..n).into_par_iter().map(f).collect()
        } else {
            (0..n).map(f).collect()
        }
    }
}

/// 在拥有 `workers` 个线程的局部线程池中运行 `op`. `workers == 0`
/// 时直接使用全局线程池.
#[cfg(feature = "rayon")]
pub fn with_workers<R, OP>(workers: usize, op: OP) -> GradingResult<R>
where
    R: Send,
    OP: FnOnce() -> R + Send,
{
    if workers == 0 {
        return Ok(op());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()?;
    Ok(pool.install(op))
}

/// 未启用 `rayon` 时, 线程数设置被忽略.
#[cfg(not(feature = "rayon"))]
pub fn with_workers<R, OP>(_workers: usize, op: OP) -> GradingResult<R>
where
    OP: FnOnce() -> R,
{
    Ok(op())
}
