//! 子命令的实际运行.

use std::env;
use std::path::{Path, PathBuf};

use cart_berry::dataset::{home_dataset_dir_with, GradeTable};
use cart_berry::pipeline::{
    list_samples, process_batch, train_and_evaluate, train_model, BatchReport,
};
use cart_berry::segment::{KMeansSegmenter, PrecomputedSegmenter, SegmentationMethod};
use cart_berry::weights::write_binary_weights;
use cart_berry::{GradingConfig, GradingError, GradingResult};
use log::{info, warn};

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 获取样本根目录.
///
/// 1. 若环境变量 `$CART_SAMPLES_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/samples`.
pub fn samples_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("CART_SAMPLES_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => home_dataset_dir_with(["samples"]),
    }
}

/// 预处理 `input` 下的全部样本.
pub fn preprocess(
    config: &GradingConfig,
    input: &Path,
    output: &Path,
    masks: Option<&Path>,
) -> GradingResult<BatchReport> {
    let samples = list_samples(input)?;
    info!("{} samples under {}", samples.len(), input.display());

    let mask_root = masks.map(Path::to_path_buf).or_else(|| {
        (config.segmentation.method == SegmentationMethod::Precomputed)
            .then(|| input.join("masks"))
    });
    let report = match (mask_root, config.segmentation.method) {
        (Some(root), _) => {
            let mut report = BatchReport::default();
            for dir in &samples {
                let name = dir.file_name().map(PathBuf::from).unwrap_or_default();
                let segmenter = PrecomputedSegmenter::new(root.join(name), config.loader.workers);
                let one = process_batch(std::slice::from_ref(dir), config, &segmenter, output);
                report.succeeded.extend(one.succeeded);
                report.failed.extend(one.failed);
            }
            report
        }
        (None, SegmentationMethod::KMeans) => {
            let segmenter = KMeansSegmenter::from_config(&config.segmentation);
            process_batch(&samples, config, &segmenter, output)
        }
        (None, method) => {
            return Err(GradingError::UnsupportedMethod(format!(
                "{method:?} segmentation from the command line"
            )))
        }
    };
    for (dir, e) in &report.failed {
        warn!("skipped {}: {e}", dir.display());
    }
    Ok(report)
}

/// `regress` 子命令的参数.
pub struct RegressArgs<'a> {
    pub archives: &'a Path,
    pub grades: &'a Path,
    pub keys: Vec<&'a str>,
    pub group_column: Option<&'a str>,
    pub weights: Option<&'a Path>,
    pub report: Option<&'a Path>,
}

/// 交叉验证, 并按需写出权重和报告.
pub fn regress(config: &GradingConfig, args: &RegressArgs<'_>) -> GradingResult<()> {
    let table = GradeTable::from_csv(args.grades)?;
    let (set, outcome) =
        train_and_evaluate(args.archives, &table, &args.keys, args.group_column, config)?;
    let m = &outcome.metrics;
    println!(
        "{} samples, {} folds: mse {:.4}, mae {:.4}, r2 {:.4}, pearson {:.4}, spearman {:.4}{}",
        set.ids.len(),
        outcome.n_folds,
        m.mse,
        m.mae,
        m.r2,
        m.pearson,
        m.spearman,
        m.auc.map(|a| format!(", auc {a:.4}")).unwrap_or_default()
    );

    if let Some(path) = args.report {
        let report = serde_json::json!({
            "model": config.regression.model,
            "split": config.regression.split,
            "keys": args.keys,
            "aggregate": config.regression.aggregate,
            "ids": set.ids,
            "grades": set.grades.to_vec(),
            "predictions": outcome.predictions.to_vec(),
            "coefficients": outcome.coefficients.as_ref().map(|c| c.to_vec()),
            "intercept": outcome.intercept,
            "metrics": outcome.metrics,
        });
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("report written to {}", path.display());
    }

    if let Some(path) = args.weights {
        let model = train_model(args.archives, &table, &args.keys, config)?;
        write_binary_weights(path, &model.to_binary())?;
        info!("weights written to {}", path.display());
    }
    Ok(())
}
