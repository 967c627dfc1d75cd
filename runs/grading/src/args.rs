//! 命令行参数.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

/// µCT 软骨样本分级流程.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON 配置文件. 缺失的字段取默认值
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// 日志级别 (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    pub log_level: LevelFilter,

    /// 工作线程数, 缺省时使用全部可用核心
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

/// 子命令.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// 预处理样本切片, 为每个样本写出特征图像归档
    Preprocess {
        /// 样本根目录, 每个子目录是一个样本.
        /// 缺省时依次尝试 `$CART_SAMPLES_DIR` 和 `$HOME/dataset/samples`
        #[arg(long, value_name = "DIR")]
        input: Option<PathBuf>,

        /// 归档输出目录
        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        /// 事先保存的掩膜根目录, 每个子目录与样本同名.
        /// 给定时使用这些掩膜代替配置中的分割方法
        #[arg(long, value_name = "DIR")]
        masks: Option<PathBuf>,
    },

    /// 在特征图像归档上交叉验证回归模型
    Regress {
        /// 归档目录
        #[arg(long, value_name = "DIR")]
        archives: PathBuf,

        /// 分级表 (CSV, 第一列为样本 id)
        #[arg(long, value_name = "FILE")]
        grades: PathBuf,

        /// 分级列名, 可重复
        #[arg(long = "key", value_name = "NAME", required = true)]
        keys: Vec<String>,

        /// 多列分级的聚合方式 (sum 或 mean), 缺省时使用配置中的值
        #[arg(long, value_name = "MODE")]
        grade_mode: Option<String>,

        /// 分组 (患者) 列名, leave-one-group-out 时必需
        #[arg(long, value_name = "NAME")]
        group_column: Option<String>,

        /// 在全部样本上训练并写出二进制权重
        #[arg(long, value_name = "FILE")]
        weights: Option<PathBuf>,

        /// 写出逐样本预测与指标的 JSON 报告
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// 打印默认配置
    DumpConfig,
}
