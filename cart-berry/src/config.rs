//! 流程配置.
//!
//! [`GradingConfig`] 构造一次后按引用传递给所有阶段, 不可变, 也没有任何全局状态.
//! 每个字段都有与原始研究流程一致的默认值, 所以通常只需要覆盖少数字段.
//!
//! 启用 `serde` 特性后, 可以通过 [`GradingConfig::from_json_file`] 从 JSON 加载.
//! 缺失的字段使用默认值.

#[cfg(feature = "serde")]
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::consts::{BBOX_MIN_AREA, BBOX_THRESHOLD, ORIENT_MAX_BYTES, SLICE_EXTENSIONS};
use crate::crop::{CropMethod, LargeSample};
use crate::dataset::Aggregate;
use crate::pca::{FeatureFit, NComponents};
use crate::regression::cv::Split;
use crate::regression::{GradeTransform, ModelKind};
use crate::segment::SegmentationMethod;
use crate::orient::OrientMethod;
use crate::voi::DeepDepth;

#[cfg(feature = "serde")]
use crate::GradingResult;

/// 完整流程配置.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct GradingConfig {
    /// 切片加载.
    pub loader: LoaderConfig,

    /// 体定向.
    pub orient: OrientConfig,

    /// 中心裁剪.
    pub crop: CropConfig,

    /// 界面分割.
    pub segmentation: SegmentationConfig,

    /// VOI 尺寸.
    pub voi: VoiConfig,

    /// 特征与 PCA.
    pub features: FeatureConfig,

    /// 回归与交叉验证.
    pub regression: RegressionConfig,
}

impl GradingConfig {
    /// 从 JSON 文件加载配置, 缺失字段取默认值.
    #[cfg(feature = "serde")]
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> GradingResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::GradingError::load_failure(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// 将配置写为格式化的 JSON 文件.
    #[cfg(feature = "serde")]
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> GradingResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// 切片加载配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct LoaderConfig {
    /// 工作线程数, `0` 表示使用全部逻辑核.
    pub workers: usize,

    /// 包围盒二值化阈值.
    pub bbox_threshold: u8,

    /// 包围盒最小面积.
    pub bbox_min_area: usize,

    /// 切片文件扩展名 (小写).
    pub extensions: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            bbox_threshold: BBOX_THRESHOLD,
            bbox_min_area: BBOX_MIN_AREA,
            extensions: SLICE_EXTENSIONS.iter().map(|e| (*e).to_owned()).collect(),
        }
    }
}

/// 定向配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct OrientConfig {
    /// 定向方法.
    pub method: OrientMethod,

    /// 体数据字节数超过该值时跳过定向.
    pub max_bytes: usize,

    /// 参与 PCA 与梯度下降的前景点数上限, 超出时等间隔抽样.
    pub max_points: usize,

    /// 梯度下降的最大迭代次数.
    pub max_iterations: usize,
}

impl Default for OrientConfig {
    fn default() -> Self {
        Self {
            method: OrientMethod::BoundingBox,
            max_bytes: ORIENT_MAX_BYTES,
            max_points: 200_000,
            max_iterations: 200,
        }
    }
}

/// 裁剪配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CropConfig {
    /// 样本中心估计方法.
    pub method: CropMethod,

    /// 裁剪窗口的高.
    pub height: usize,

    /// 裁剪窗口的宽.
    pub width: usize,

    /// 宽样本使用的窗口宽度, 仅在 `use_wide` 时生效.
    pub size_wide: usize,

    /// 是否使用 `size_wide` 作为窗口宽度.
    pub use_wide: bool,

    /// 大样本规则, `None` 表示禁用.
    pub large: Option<LargeSample>,

    /// 分割后在 h/w 方向上各边额外去掉的体素数.
    pub border: usize,

    /// 是否将裁剪后的体数据切分为 3×3 个子体分别处理.
    pub subvolumes: bool,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            method: CropMethod::Moment,
            height: 448,
            width: 448,
            size_wide: 640,
            use_wide: false,
            large: Some(LargeSample::default()),
            border: 24,
            subvolumes: false,
        }
    }
}

impl CropConfig {
    /// 实际使用的窗口尺寸 `(高, 宽)`, 未考虑大样本规则.
    #[inline]
    pub fn window(&self) -> (usize, usize) {
        let w = if self.use_wide {
            self.size_wide
        } else {
            self.width
        };
        (self.height, w)
    }
}

/// 分割配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SegmentationConfig {
    /// 分割方法.
    pub method: SegmentationMethod,

    /// k-means 聚类数.
    pub clusters: usize,

    /// 两个方向投票的一致性阈值.
    pub agreement: f64,

    /// 外部模型输出概率的二值化阈值.
    pub threshold: f32,

    /// 底部忽略的切片数, `None` 表示按深度自动选择.
    pub bottom_offset: Option<usize>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            method: SegmentationMethod::KMeans,
            clusters: 3,
            agreement: 0.7,
            threshold: 0.5,
            bottom_offset: None,
        }
    }
}

/// VOI 尺寸配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct VoiConfig {
    /// 表层 VOI 深度.
    pub surface: usize,

    /// 深层 VOI 深度.
    pub deep: DeepDepth,

    /// 钙化层 VOI 深度.
    pub calcified: usize,

    /// 深层/钙化层与界面之间的间隔.
    pub offset: usize,

    /// 界面索引中值滤波的核大小, `0` 或 `1` 表示不滤波.
    pub median: usize,

    /// 表层深度大于 25 时, 是否额外保存前后两半的投影.
    pub halves: bool,
}

impl Default for VoiConfig {
    fn default() -> Self {
        Self {
            surface: 25,
            deep: DeepDepth::Auto(0.6),
            calcified: 50,
            offset: 10,
            median: 5,
            halves: true,
        }
    }
}

/// 特征与 PCA 配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct FeatureConfig {
    /// 投影图像中心裁剪的最大边长.
    pub max_roi: Option<usize>,

    /// 主成分数目.
    pub n_components: NComponents,

    /// 是否白化.
    pub whiten: bool,

    /// PCA 在全部样本上拟合还是每折独立拟合.
    pub fit: FeatureFit,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            max_roi: Some(400),
            n_components: NComponents::Variance(0.9),
            whiten: true,
            fit: FeatureFit::PerFold,
        }
    }
}

/// 回归配置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct RegressionConfig {
    /// 模型.
    pub model: ModelKind,

    /// 划分方式.
    pub split: Split,

    /// 是否按训练折均值中心化特征.
    pub standardize: bool,

    /// 分级变换.
    pub transform: GradeTransform,

    /// 多个分级列的聚合方式.
    pub aggregate: Aggregate,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::default(),
            split: Split::LeaveOneGroupOut,
            standardize: false,
            transform: GradeTransform::None,
            aggregate: Aggregate::Sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 默认值需要与历史流程保持一致.
    #[test]
    fn test_defaults() {
        let cfg = GradingConfig::default();
        assert_eq!(cfg.orient.method, OrientMethod::BoundingBox);
        assert_eq!(cfg.crop.method, CropMethod::Moment);
        assert_eq!(cfg.crop.window(), (448, 448));
        assert_eq!(cfg.crop.border, 24);
        assert_eq!(cfg.voi.surface, 25);
        assert_eq!(cfg.voi.calcified, 50);
        assert_eq!(cfg.voi.offset, 10);
        assert_eq!(cfg.features.n_components, NComponents::Variance(0.9));
        assert_eq!(cfg.regression.split, Split::LeaveOneGroupOut);
        assert_eq!("random_forest".parse::<ModelKind>().unwrap().seed(), Some(42));
    }

    #[test]
    fn test_wide_window() {
        let cfg = CropConfig {
            use_wide: true,
            ..Default::default()
        };
        assert_eq!(cfg.window(), (448, 640));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_json() {
        let cfg: GradingConfig = serde_json::from_str(
            r#"{
                "orient": { "method": "pca" },
                "voi": { "surface": 40, "deep": { "fixed": 150 } },
                "regression": { "model": { "kind": "lasso", "alpha": 0.1 }, "aggregate": "mean" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.orient.method, OrientMethod::Pca);
        assert_eq!(cfg.orient.max_bytes, ORIENT_MAX_BYTES);
        assert_eq!(cfg.voi.surface, 40);
        assert_eq!(cfg.voi.deep, DeepDepth::Fixed(150));
        assert_eq!(cfg.voi.offset, 10);
        assert_eq!(cfg.regression.aggregate, Aggregate::Mean);
        assert_eq!(
            cfg.regression.model,
            ModelKind::Lasso {
                alpha: 0.1,
                fit_intercept: true,
                normalize: true
            }
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = GradingConfig::default();
        cfg.crop.method = CropMethod::Mass;
        cfg.features.n_components = NComponents::Count(12);
        cfg.to_json_file(&path).unwrap();
        assert_eq!(GradingConfig::from_json_file(&path).unwrap(), cfg);
    }
}
