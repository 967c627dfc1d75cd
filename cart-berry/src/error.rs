//! 本 crate 统一使用的错误类型.

use std::path::PathBuf;

use thiserror::Error;

/// 软骨分级流程中可能出现的全部错误.
///
/// # 注意
///
/// 体数据过大而跳过定向不属于错误, 见 [`crate::orient::Orientation::Skipped`].
#[derive(Debug, Error)]
pub enum GradingError {
    /// 文件缺失、损坏, 或目录中没有可用的切片/数据.
    #[error("failed to load `{}`: {reason}", path.display())]
    LoadFailure {
        /// 出错的路径.
        path: PathBuf,
        /// 具体原因.
        reason: String,
    },

    /// 切片尺寸不一致, 掩膜与体数据形状不符, 或特征/标签/分组长度不一致.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// 分割掩膜为空, 或任何一列都无法得到合法的 VOI.
    #[error("segmentation failure: {0}")]
    SegmentationFailure(String),

    /// 未知的方法名, 或方法与参数组合不受支持.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 切片图像编解码错误.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// 读取 `.npz` 容器失败.
    #[error(transparent)]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    /// 写入 `.npz` 容器失败.
    #[error(transparent)]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    /// 线性代数求解失败 (奇异矩阵, SVD 不收敛等).
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    /// 分级表格解析失败.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// 配置文件解析失败.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// 无法创建工作线程池.
    #[cfg(feature = "rayon")]
    #[error(transparent)]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl GradingError {
    /// 便捷构造 [`GradingError::LoadFailure`].
    #[inline]
    pub fn load_failure<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        Self::LoadFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// 本 crate 的 `Result` 别名.
pub type GradingResult<T> = Result<T, GradingError>;
