//! 单样本与批量处理流程, 以及基于持久化特征图像的训练评估.
//!
//! 单样本流程: 加载 → 定向 → 中心裁剪 → 去边 → 分割 → 翻转 → VOI → 投影 → 保存.
//! 任何一步出错都会中止该样本, 已计算的结果不会写出.
//! 分割在原始方向 (骨侧在 `z = 0`) 上进行, 底部偏移也按这个方向计算.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use ndarray::Array1;

use crate::config::GradingConfig;
use crate::consts::{SUBVOLUME_GRID, SUBVOLUME_STRIDE, SUBVOLUME_TILE};
use crate::crop::{crop_border, crop_center, subvolumes, CropWindow};
use crate::data::par::try_map_indexed;
use crate::dataset::{
    list_slices, load_stack_with, write_vois, GradeTable, VoiArchive, ARCHIVE_EXTENSION,
};
use crate::meanstd::{half_images, ZoneImages};
use crate::orient::{orient, Angles};
use crate::pca::feature_matrix;
use crate::regression::{cross_validate, CvOutcome};
use crate::segment::Segmenter;
use crate::voi::{extract_vois, Vois, Zone};
use crate::weights::GradingModel;
use crate::{GradingError, GradingResult, Volume, VoxelGrid};

/// 单个样本的处理结果.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleReport {
    /// 样本名, 即切片目录名.
    pub name: String,
    /// 定向使用的倾角.
    pub angles: Angles,
    /// 是否因体数据过大跳过了定向.
    pub orientation_skipped: bool,
    /// 中心裁剪窗口.
    pub window: CropWindow,
    /// 参与 VOI 提取的列数 (所有子体之和).
    pub valid_columns: usize,
    /// 写出的归档.
    pub outputs: Vec<PathBuf>,
}

/// 批量处理结果.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// 成功的样本.
    pub succeeded: Vec<SampleReport>,
    /// 失败的样本目录及原因.
    pub failed: Vec<(PathBuf, GradingError)>,
}

/// 样本名: 目录的最后一级.
fn sample_name(dir: &Path) -> GradingResult<String> {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| GradingError::load_failure(dir, "sample directory has no name"))
}

fn archive_path(out_dir: &Path, stem: &str) -> PathBuf {
    out_dir.join(format!("{stem}.{ARCHIVE_EXTENSION}"))
}

/// 对已裁剪的体数据分割, 然后体数据与掩膜一起去边、翻转, 再提取 VOI.
fn grade_volume(
    volume: &Volume,
    config: &GradingConfig,
    segmenter: &dyn Segmenter,
) -> GradingResult<Vois> {
    let mask = segmenter.segment(volume)?;
    mask.check_against(volume)?;
    let n = config.crop.border;
    let (_, h, w) = volume.shape();
    let volume = crop_border(volume, n)?;
    let mask = mask.crop_plane(n..h - n, n..w - n)?;
    let (volume, mask) = (volume.flip_depth(), mask.flip_depth());
    extract_vois(&volume, &mask, &config.voi)
}

/// VOI 的投影, 以及 (按配置) 前后两半的投影, 连同各自的文件名.
fn projections(stem: &str, vois: &Vois, config: &GradingConfig) -> Vec<(String, ZoneImages)> {
    let mut ans = vec![(stem.to_owned(), ZoneImages::from_vois(vois))];
    if config.voi.halves {
        if let Some((first, second)) = half_images(vois) {
            ans.push((format!("{stem}_25"), first));
            ans.push((format!("{stem}_25_backup"), second));
        }
    }
    ans
}

/// 处理单个样本, 结果写入 `out_dir/{样本名}.npz`.
///
/// 启用子体切分时, 每个子体单独分割与提取, 写入 `{样本名}_sub{i}{j}.npz`.
/// 表层深度大于 25 且启用 `halves` 时另外写出 `_25` 与 `_25_backup` 两个归档.
pub fn process_sample<P: AsRef<Path>, Q: AsRef<Path>>(
    dir: P,
    config: &GradingConfig,
    segmenter: &dyn Segmenter,
    out_dir: Q,
) -> GradingResult<SampleReport> {
    let (dir, out_dir) = (dir.as_ref(), out_dir.as_ref());
    let name = sample_name(dir)?;
    info!("processing sample {name}");

    let (volume, bboxes) = load_stack_with(dir, &config.loader)?;
    let orientation = orient(volume, &bboxes, &config.orient)?;
    let (angles, orientation_skipped) = (orientation.angles(), orientation.is_skipped());
    let volume = orientation.into_volume();
    let (volume, window) = crop_center(
        &volume,
        config.crop.window(),
        config.crop.method,
        config.crop.large,
    )?;

    let parts: Vec<(String, Volume)> = if config.crop.subvolumes {
        let tiles = subvolumes(&volume, SUBVOLUME_TILE, SUBVOLUME_STRIDE, SUBVOLUME_GRID)?;
        if tiles.is_empty() {
            return Err(GradingError::ShapeMismatch(format!(
                "no {SUBVOLUME_TILE}x{SUBVOLUME_TILE} subvolume fits the {:?} crop",
                window.size()
            )));
        }
        tiles
            .into_iter()
            .map(|((i, j), v)| (format!("{name}_sub{i}{j}"), v))
            .collect()
    } else {
        vec![(name.clone(), volume)]
    };

    let mut pending = Vec::new();
    let mut valid_columns = 0;
    for (stem, part) in &parts {
        let vois = grade_volume(part, config, segmenter)?;
        valid_columns += vois.valid_columns;
        pending.extend(projections(stem, &vois, config));
    }

    // 任何一个归档写入失败时, 删除本样本已写出的归档.
    let mut outputs = Vec::with_capacity(pending.len());
    for (stem, images) in &pending {
        let path = archive_path(out_dir, stem);
        if let Err(e) = write_vois(&path, images) {
            for done in &outputs {
                let _ = fs::remove_file(done);
            }
            return Err(e);
        }
        outputs.push(path);
    }
    info!("sample {name} done, {} archives written", outputs.len());

    Ok(SampleReport {
        name,
        angles,
        orientation_skipped,
        window,
        valid_columns,
        outputs,
    })
}

/// 依次处理多个样本. 单个样本失败只记录日志, 不影响其余样本.
pub fn process_batch<P: AsRef<Path>>(
    samples: &[PathBuf],
    config: &GradingConfig,
    segmenter: &dyn Segmenter,
    out_dir: P,
) -> BatchReport {
    let out_dir = out_dir.as_ref();
    let mut report = BatchReport::default();
    for dir in samples {
        match process_sample(dir, config, segmenter, out_dir) {
            Ok(r) => report.succeeded.push(r),
            Err(e) => {
                error!("sample {} failed: {e}", dir.display());
                report.failed.push((dir.clone(), e));
            }
        }
    }
    info!(
        "batch finished: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    report
}

/// 列出 `root` 下所有包含切片的子目录, 按名称排序.
pub fn list_samples<P: AsRef<Path>>(root: P) -> GradingResult<Vec<PathBuf>> {
    let root = root.as_ref();
    let entries = fs::read_dir(root).map_err(|e| GradingError::load_failure(root, e))?;
    let mut ans = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && !list_slices(&path)?.is_empty() {
            ans.push(path);
        }
    }
    ans.sort();
    Ok(ans)
}

/// 由分级表和特征图像归档整理出的训练数据.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSet {
    /// 样本 id, 与特征矩阵的行一一对应.
    pub ids: Vec<String>,
    /// 特征矩阵, 每行一个样本.
    pub features: ndarray::Array2<f64>,
    /// 分级.
    pub grades: Array1<f64>,
    /// 分组, 未指定分组列时为 `None`.
    pub groups: Option<Vec<i64>>,
}

/// 读取 `npz_dir` 中分级表里每个样本的归档, 构造训练数据.
///
/// 分区由分级名称的前缀决定, 所有 `keys` 必须属于同一个分区.
/// 多个 `keys` 的分级按 `config.regression.aggregate` 相加或平均.
/// 分级表中没有归档的样本被跳过.
pub fn load_features<P: AsRef<Path>>(
    npz_dir: P,
    table: &GradeTable,
    keys: &[&str],
    group_column: Option<&str>,
    config: &GradingConfig,
) -> GradingResult<FeatureSet> {
    let npz_dir = npz_dir.as_ref();
    let zone = zone_of(keys)?;

    let (ids, missing): (Vec<String>, Vec<String>) = table
        .ids()
        .iter()
        .cloned()
        .partition(|id| archive_path(npz_dir, id).is_file());
    if !missing.is_empty() {
        warn!("{} graded samples have no archive: {}", missing.len(), missing.join(", "));
    }
    if ids.is_empty() {
        return Err(GradingError::load_failure(npz_dir, "no archive matches the grade table"));
    }

    let table = table.for_samples(&ids)?;
    let grades = table.select(keys, config.regression.aggregate)?;
    let groups = group_column.map(|c| table.groups(c)).transpose()?;

    let images = try_map_indexed(ids.len(), |i| {
        VoiArchive::open(archive_path(npz_dir, &ids[i]))?.zone(zone)
    })?;
    let features = feature_matrix(images.iter().map(|a| a.view()), config.features.max_roi)?;
    info!(
        "{} samples, {} features from the {zone} zone",
        features.nrows(),
        features.ncols()
    );
    Ok(FeatureSet {
        ids,
        features,
        grades,
        groups,
    })
}

fn zone_of(keys: &[&str]) -> GradingResult<Zone> {
    let Some(first) = keys.first() else {
        return Err(GradingError::UnsupportedMethod("no grade key given".to_owned()));
    };
    let zone = Zone::from_key(first)?;
    for key in &keys[1..] {
        if Zone::from_key(key)? != zone {
            return Err(GradingError::UnsupportedMethod(format!(
                "grades `{first}` and `{key}` belong to different zones"
            )));
        }
    }
    Ok(zone)
}

/// 读取特征并做交叉验证.
pub fn train_and_evaluate<P: AsRef<Path>>(
    npz_dir: P,
    table: &GradeTable,
    keys: &[&str],
    group_column: Option<&str>,
    config: &GradingConfig,
) -> GradingResult<(FeatureSet, CvOutcome)> {
    let set = load_features(npz_dir, table, keys, group_column, config)?;
    let outcome = cross_validate(
        set.features.view(),
        set.grades.view(),
        set.groups.as_deref(),
        &config.regression,
        Some(&config.features),
    )?;
    Ok((set, outcome))
}

/// 在全部样本上训练可以导出为二进制权重的分级模型.
pub fn train_model<P: AsRef<Path>>(
    npz_dir: P,
    table: &GradeTable,
    keys: &[&str],
    config: &GradingConfig,
) -> GradingResult<GradingModel> {
    let set = load_features(npz_dir, table, keys, None, config)?;
    GradingModel::fit(set.features.view(), set.grades.view(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{read_vois, save_stack, Aggregate};
    use crate::regression::ModelKind;
    use crate::segment::FnSegmenter;
    use ndarray::{Array2, Array3};

    /// 原始方向的分层样本: 骨 `z < 65`, 软骨 `65..165`, 之上为空气.
    fn raw_sample() -> Volume {
        Volume::new(Array3::from_shape_fn((170, 48, 48), |(z, _, _)| match z {
            0..=64 => 200,
            65..=164 => 150,
            _ => 0,
        }))
    }

    fn config() -> GradingConfig {
        let mut config = GradingConfig::default();
        config.crop.height = 32;
        config.crop.width = 32;
        config.crop.large = None;
        config.crop.border = 4;
        config.voi.surface = 30;
        config
    }

    fn bone_segmenter(
    ) -> FnSegmenter<impl Fn(&Volume) -> GradingResult<Array3<f32>> + Send + Sync> {
        FnSegmenter::new(
            |v: &Volume| -> GradingResult<Array3<f32>> {
                Ok(v.data().mapv(|p| if p >= 200 { 1.0 } else { 0.0 }))
            },
            0.5,
        )
    }

    #[test]
    fn test_process_sample() {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("sample_1");
        save_stack(&dir, "rec_", &raw_sample()).unwrap();
        let out = root.path().join("out");

        let report = process_sample(&dir, &config(), &bone_segmenter(), &out).unwrap();
        assert_eq!(report.name, "sample_1");
        assert!(!report.orientation_skipped);
        assert_eq!(report.window.size(), (32, 32));
        assert_eq!(report.valid_columns, 24 * 24);
        assert_eq!(
            report.outputs,
            vec![
                out.join("sample_1.npz"),
                out.join("sample_1_25.npz"),
                out.join("sample_1_25_backup.npz"),
            ]
        );

        // 表层全部是软骨, 投影为常数 150 (标准差为零).
        let images = read_vois(&report.outputs[0]).unwrap();
        assert_eq!(images.surf.dim(), (24, 24));
        assert!(images.surf.iter().all(|v| (*v - 150.0).abs() < 1e-9));
        assert!(images.calc.iter().all(|v| (*v - 200.0).abs() < 1e-9));
    }

    /// 分割器看到的是去边之前的整个裁剪窗口.
    #[test]
    fn test_segments_before_border_crop() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("sample_2");
        save_stack(&dir, "rec_", &raw_sample()).unwrap();
        let segmenter = FnSegmenter::new(
            |v: &Volume| -> GradingResult<Array3<f32>> {
                if v.slice_shape() != (32, 32) {
                    return Err(GradingError::ShapeMismatch(format!(
                        "segmenter got {:?}",
                        v.slice_shape()
                    )));
                }
                Ok(v.data().mapv(|p| if p >= 200 { 1.0 } else { 0.0 }))
            },
            0.5,
        );
        let report = process_sample(&dir, &config(), &segmenter, root.path().join("out")).unwrap();
        assert_eq!(report.valid_columns, 24 * 24);
    }

    /// 后面的归档写入失败时, 已写出的归档被删除, 也不留下临时文件.
    #[test]
    fn test_failed_write_leaves_no_archives() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("sample_1");
        save_stack(&dir, "rec_", &raw_sample()).unwrap();
        let out = root.path().join("out");
        let blocker = out.join("sample_1_25.npz");
        std::fs::create_dir_all(&blocker).unwrap();

        assert!(process_sample(&dir, &config(), &bone_segmenter(), &out).is_err());
        let left: Vec<PathBuf> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(left, vec![blocker]);
    }

    #[test]
    fn test_batch_is_fail_soft() {
        let root = tempfile::tempdir().unwrap();
        let good = root.path().join("a_good");
        save_stack(&good, "rec_", &raw_sample()).unwrap();
        // 全黑样本没有界面.
        let bad = root.path().join("b_empty");
        save_stack(&bad, "rec_", &Volume::new(Array3::zeros((170, 48, 48)))).unwrap();
        std::fs::create_dir(root.path().join("c_no_slices")).unwrap();

        let samples = list_samples(root.path()).unwrap();
        assert_eq!(samples, vec![good.clone(), bad.clone()]);

        let out = root.path().join("out");
        let report = process_batch(&samples, &config(), &bone_segmenter(), &out);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad);
        assert!(!out.join("b_empty.npz").exists());
    }

    /// 8 个样本, 每 2 个一组, 表层图像的亮度随分级线性变化.
    fn feature_dir(dir: &Path) -> GradeTable {
        let mut csv = String::from("id,surf_sub,deep_mat,patient,surf_ecm\n");
        for i in 0..8 {
            let grade = (i % 4) as f64;
            let surf = Array2::from_shape_fn((6, 6), |(h, w)| {
                grade * (1.0 + h as f64) + ((h * 5 + w * 3 + i) % 7) as f64 * 0.01
            });
            let images = ZoneImages {
                surf,
                deep: Array2::zeros((6, 6)),
                calc: Array2::zeros((6, 6)),
            };
            write_vois(archive_path(dir, &format!("s{i}")), &images).unwrap();
            csv.push_str(&format!("s{i},{grade},1,{},3\n", i / 2));
        }
        // 没有归档的样本.
        csv.push_str("s9,2,1,9,3\n");
        GradeTable::from_reader(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_train_and_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let table = feature_dir(dir.path());
        let mut config = GradingConfig::default();
        config.features.max_roi = Some(4);
        config.regression.model = ModelKind::Ridge {
            alpha: 0.1,
            fit_intercept: true,
            normalize: false,
        };

        let (set, outcome) =
            train_and_evaluate(dir.path(), &table, &["surf_sub"], Some("patient"), &config).unwrap();
        assert_eq!(set.ids.len(), 8);
        assert_eq!(set.features.ncols(), 16);
        assert_eq!(set.groups.as_deref(), Some(&[0, 0, 1, 1, 2, 2, 3, 3][..]));
        assert_eq!(outcome.n_folds, 4);
        assert_eq!(outcome.predictions.len(), 8);

        let model = train_model(dir.path(), &table, &["surf_sub"], &config).unwrap();
        assert_eq!(model.to_binary().width(), 16);

        assert!(matches!(
            load_features(dir.path(), &table, &["surf_sub", "deep_mat"], None, &config),
            Err(GradingError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_grade_aggregation_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let table = feature_dir(dir.path());
        let keys = ["surf_sub", "surf_ecm"];
        let mut config = GradingConfig::default();
        config.features.max_roi = Some(4);

        assert_eq!(config.regression.aggregate, Aggregate::Sum);
        let sum = load_features(dir.path(), &table, &keys, None, &config).unwrap();
        config.regression.aggregate = Aggregate::Mean;
        let mean = load_features(dir.path(), &table, &keys, None, &config).unwrap();

        assert_eq!(sum.ids, mean.ids);
        for i in 0..8 {
            let grade = (i % 4) as f64;
            assert_eq!(sum.grades[i], grade + 3.0);
            assert_eq!(mean.grades[i], (grade + 3.0) / 2.0);
        }
        assert_eq!(sum.features, mean.features);
    }
}
