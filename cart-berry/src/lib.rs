#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 对关节软骨样本的 µCT 重建体进行定向、裁剪、VOI 提取,
//! 并基于 PCA + 回归模型预测组织病理学分级.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 体数据统一按照 `(z, H, W)` 组织, `z` 为切片 (深度) 方向.
//!   原始扫描的 `z = 0` 是样本底部 (骨侧); 翻转后 `z = 0` 是软骨表面侧.
//! 2. 所有可能失败的 I/O 和数值路径都返回 [`GradingResult`],
//!   只有内部不变量使用 `debug_assert!`.
//! 3. 配置是只读的 [`GradingConfig`], 构造一次后按引用传递.
//!   拟合得到的统计量 (均值, PCA 等) 总是作为返回值向下传递, 没有全局状态.
//!
//! # 处理流程
//!
//! ### 切片堆栈加载 ✅
//!
//! 按文件名序读取切片, 同时计算每个切片的样本包围盒.
//!
//! 实现位于 `cart-berry/src/dataset/stack.rs`.
//!
//! ### 体定向 ✅
//!
//! 包围盒直线拟合、前景点云 PCA、梯度下降细化以及二者平均.
//! 体数据过大时跳过定向 (不是错误).
//!
//! 实现位于 `cart-berry/src/orient`.
//!
//! ### 中心裁剪 ✅
//!
//! 基于图像矩或质心估计样本中心, 窗口越界时夹紧到最近的合法位置.
//!
//! 实现位于 `cart-berry/src/crop.rs`.
//!
//! ### 骨-软骨界面分割 ✅
//!
//! 可插拔的 [`segment::Segmenter`]. 自带 k-means 实现, 外部网络通过闭包接入.
//!
//! ### VOI 提取与均值/标准差投影 ✅
//!
//! 实现位于 `cart-berry/src/voi.rs` 和 `cart-berry/src/meanstd.rs`.
//!
//! ### 白化 PCA 与交叉验证回归 ✅
//!
//! Leave-one-out / leave-one-group-out, 每折独立拟合 PCA 和中心化统计量.
//!
//! 实现位于 `cart-berry/src/pca.rs` 和 `cart-berry/src/regression`.
//!
//! ### 模型权重二进制格式 ✅
//!
//! 与旧版读取器逐字节兼容. 实现位于 `cart-berry/src/weights.rs`.

/// 二维索引 `(h, w)`, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引 `(z, h, w)`, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 二维连通区域.
pub type Area2d = Vec<Idx2d>;

/// 多个二维连通区域.
pub type Areas2d = Vec<Area2d>;

mod error;

pub use error::{GradingError, GradingResult};

pub mod config;

pub use config::GradingConfig;

pub mod consts;

/// 体数据、掩膜与包围盒等基础数据结构.
mod data;

pub use data::{par, BoundingBox, Mask, Volume, VoxelGrid};

pub mod threshold;

pub mod fitting;

pub mod orient;

pub mod crop;

pub mod segment;

pub mod voi;

pub mod meanstd;

pub mod pca;

pub mod regression;

pub mod weights;

pub mod dataset;

pub mod pipeline;

pub mod prelude;
