//! 切片堆栈的读写.
//!
//! 一个样本的重建结果是目录中的一组二维灰度图像, 文件名形如
//! `{前缀}{序号}.{png|bmp|tif}`, 其中扩展名前至少有三位数字.
//! 文件名的字典序即为深度方向的顺序.

use std::fs;
use std::path::{Path, PathBuf};

use image::GrayImage;
use log::{debug, info};
use ndarray::{Array2, Array3};

use crate::config::LoaderConfig;
use crate::consts::gray::mask_to_gray;
use crate::consts::{SLICE_EXTENSIONS, SLICE_INDEX_DIGITS};
use crate::data::par::{map_indexed, try_map_indexed, with_workers};
use crate::threshold::bounding_box;
use crate::{BoundingBox, GradingError, GradingResult, Mask, Volume, VoxelGrid};

/// 文件名是否符合切片命名规则? `extensions` 为小写扩展名.
fn is_slice_file<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            extensions.iter().any(|x| x.as_ref() == e)
        })
        .unwrap_or(false);
    let stem_ok = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| {
            let b = s.as_bytes();
            b.len() >= SLICE_INDEX_DIGITS
                && b[b.len() - SLICE_INDEX_DIGITS..]
                    .iter()
                    .all(u8::is_ascii_digit)
        })
        .unwrap_or(false);
    ext_ok && stem_ok
}

/// 列出 `dir` 下所有默认扩展名的切片文件, 按文件名排序.
#[inline]
pub fn list_slices<P: AsRef<Path>>(dir: P) -> GradingResult<Vec<PathBuf>> {
    list_slices_with(dir, &SLICE_EXTENSIONS)
}

/// 列出 `dir` 下所有扩展名属于 `extensions` 的切片文件, 按文件名排序.
pub fn list_slices_with<P: AsRef<Path>, S: AsRef<str>>(
    dir: P,
    extensions: &[S],
) -> GradingResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(|e| GradingError::load_failure(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_slice_file(&path, extensions) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// 读取单张切片为 `(H, W)` 灰度数组. 彩色图像按亮度转换.
fn read_slice(path: &Path) -> GradingResult<Array2<u8>> {
    let img = image::open(path)
        .map_err(|e| GradingError::load_failure(path, e))?
        .into_luma8();
    let (w, h) = img.dimensions();
    Array2::from_shape_vec((h as usize, w as usize), img.into_raw())
        .map_err(|e| GradingError::load_failure(path, e))
}

/// 读取 `dir` 下的切片堆栈, 使用默认的包围盒参数.
///
/// 见 [`load_stack_with`].
pub fn load_stack<P: AsRef<Path>>(
    dir: P,
    workers: usize,
) -> GradingResult<(Volume, Vec<BoundingBox>)> {
    load_stack_with(
        dir,
        &LoaderConfig {
            workers,
            ..Default::default()
        },
    )
}

/// 读取 `dir` 下的切片堆栈, 同时计算每张切片上样本的包围盒.
///
/// 切片按文件名序排列为 `(z, H, W)` 体数据, 返回的包围盒与切片一一对应.
///
/// # 错误
///
/// 1. 目录不存在、没有切片、或任意切片无法解码时, 返回 [`GradingError::LoadFailure`].
/// 2. 切片尺寸不一致时, 返回 [`GradingError::ShapeMismatch`].
pub fn load_stack_with<P: AsRef<Path>>(
    dir: P,
    config: &LoaderConfig,
) -> GradingResult<(Volume, Vec<BoundingBox>)> {
    let dir = dir.as_ref();
    let files = list_slices_with(dir, &config.extensions)?;
    if files.is_empty() {
        return Err(GradingError::load_failure(dir, "no slice images found"));
    }
    debug!("reading {} slices from {}", files.len(), dir.display());

    let (slices, boxes) = with_workers(config.workers, || -> GradingResult<_> {
        let slices = try_map_indexed(files.len(), |i| read_slice(&files[i]))?;
        let boxes = map_indexed(slices.len(), |i| {
            bounding_box(slices[i].view(), config.bbox_threshold, config.bbox_min_area)
        });
        Ok((slices, boxes))
    })??;

    let (h, w) = slices[0].dim();
    if let Some((i, s)) = slices.iter().enumerate().find(|(_, s)| s.dim() != (h, w)) {
        return Err(GradingError::ShapeMismatch(format!(
            "slice `{}` is {:?}, expected {:?}",
            files[i].display(),
            s.dim(),
            (h, w)
        )));
    }

    let mut data = Array3::zeros((slices.len(), h, w));
    for (mut dst, src) in data.outer_iter_mut().zip(slices.iter()) {
        dst.assign(src);
    }
    info!(
        "loaded {} as {:?}, {} slices without sample",
        dir.display(),
        data.dim(),
        boxes.iter().filter(|b| b.is_empty()).count()
    );
    Ok((Volume::new(data), boxes))
}

/// 将三维数据逐层写成 PNG, 文件名为 `{prefix}{序号:08}.png`.
fn write_stack<G, F>(dir: &Path, prefix: &str, grid: &G, map: F) -> GradingResult<()>
where
    G: VoxelGrid + Sync,
    F: Fn(u8) -> u8 + Sync + Send,
{
    fs::create_dir_all(dir)?;
    let (h, w) = grid.slice_shape();
    try_map_indexed(grid.len_z(), |k| {
        let pixels = grid.slice_at(k).iter().map(|p| map(*p)).collect();
        let img = GrayImage::from_raw(w as u32, h as u32, pixels).ok_or_else(|| {
            GradingError::ShapeMismatch(format!("slice {k} does not fit {h}x{w}"))
        })?;
        img.save(dir.join(format!("{prefix}{k:08}.png")))?;
        Ok(())
    })?;
    debug!("wrote {} slices to {}", grid.len_z(), dir.display());
    Ok(())
}

/// 保存体数据切片.
pub fn save_stack<P: AsRef<Path>>(dir: P, prefix: &str, volume: &Volume) -> GradingResult<()> {
    write_stack(dir.as_ref(), prefix, volume, |p| p)
}

/// 保存掩膜切片, 前景写为白色.
pub fn save_mask_stack<P: AsRef<Path>>(dir: P, prefix: &str, mask: &Mask) -> GradingResult<()> {
    write_stack(dir.as_ref(), prefix, mask, mask_to_gray)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_slice_name_rule() {
        assert!(is_slice_file(Path::new("a/sample_rec00000123.png"), &SLICE_EXTENSIONS));
        assert!(is_slice_file(Path::new("a/x001.BMP"), &SLICE_EXTENSIONS));
        assert!(!is_slice_file(Path::new("a/sample_rec_spr.bmp"), &SLICE_EXTENSIONS));
        assert!(!is_slice_file(Path::new("a/sample01.png"), &SLICE_EXTENSIONS));
        assert!(!is_slice_file(Path::new("a/sample001.txt"), &SLICE_EXTENSIONS));
        assert!(is_slice_file(Path::new("a/x001.JPG"), &["jpg"]));
        assert!(!is_slice_file(Path::new("a/x001.png"), &["jpg"]));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((4, 8, 6), |(z, h, w)| (z * 50 + h + w) as u8);
        let volume = Volume::new(data.clone());
        save_stack(dir.path(), "s_", &volume).unwrap();
        // 无关文件不应被读入.
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = list_slices(dir.path()).unwrap();
        assert_eq!(files.len(), 4);
        assert!(files[0].ends_with("s_00000000.png"));

        let (loaded, boxes) = load_stack(dir.path(), 1).unwrap();
        assert_eq!(loaded.data(), data.view());
        assert_eq!(boxes.len(), 4);
        // 切片太小, 不会有足够大的样本区域.
        assert!(boxes.iter().all(BoundingBox::is_empty));
    }

    #[test]
    fn test_bounding_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((2, 80, 80), |(_, h, w)| {
            if (10..60).contains(&h) && (20..70).contains(&w) {
                200u8
            } else {
                0
            }
        });
        save_stack(dir.path(), "b", &Volume::new(data)).unwrap();
        let (_, boxes) = load_stack(dir.path(), 0).unwrap();
        let expected = BoundingBox {
            left: 20,
            right: 70,
            top: 10,
            bottom: 60,
        };
        assert_eq!(boxes, vec![expected; 2]);
    }

    #[test]
    fn test_mask_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mask = Mask::new(Array3::from_shape_fn((1, 3, 3), |(_, h, _)| u8::from(h == 1))).unwrap();
        save_mask_stack(dir.path(), "m", &mask).unwrap();
        let (loaded, _) = load_stack(dir.path(), 1).unwrap();
        assert_eq!(loaded[(0, 1, 0)], 255);
        assert_eq!(loaded[(0, 0, 0)], 0);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_stack(dir.path(), 1),
            Err(GradingError::LoadFailure { .. })
        ));
        assert!(matches!(
            load_stack(dir.path().join("missing"), 1),
            Err(GradingError::LoadFailure { .. })
        ));

        save_stack(dir.path(), "a", &Volume::new(Array3::zeros((1, 4, 4)))).unwrap();
        save_stack(dir.path(), "b", &Volume::new(Array3::zeros((1, 5, 4)))).unwrap();
        assert!(matches!(
            load_stack(dir.path(), 1),
            Err(GradingError::ShapeMismatch(_))
        ));

        fs::write(dir.path().join("c00000000.png"), "not an image").unwrap();
        assert!(matches!(
            load_stack(dir.path(), 1),
            Err(GradingError::LoadFailure { .. })
        ));
    }
}
