//! 数据集操作: 切片堆栈, 特征图像归档与分级表.

use std::path::{Path, PathBuf};

mod grades;
mod npz_archive;
mod stack;

pub use grades::{duplicate_vector, Aggregate, GradeTable};
pub use npz_archive::{read_vois, write_vois, VoiArchive, ARCHIVE_EXTENSION};
pub use stack::{
    list_slices, list_slices_with, load_stack, load_stack_with, save_mask_stack, save_stack,
};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    home_dataset_dir_with::<&str, _>([])
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    ans.extend(it);
    Some(ans)
}

/// 列出 `dir` 下的全部特征图像归档, 按文件名排序.
pub fn list_archives<P: AsRef<Path>>(dir: P) -> crate::GradingResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| crate::GradingError::load_failure(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == ARCHIVE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
