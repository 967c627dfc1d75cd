//! 单个样本的特征图像归档.
//!
//! 每个样本一个 `.npz` 文件, 内含 `surf`, `deep`, `calc` 三个二维 `f64` 数组.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::{Array2, Ix2, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError};

use crate::meanstd::ZoneImages;
use crate::voi::Zone;
use crate::{GradingError, GradingResult};

/// 归档文件扩展名.
pub const ARCHIVE_EXTENSION: &str = "npz";

/// 写入过程中使用的临时文件路径.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// 将三个分区的特征图像写入 `path`.
///
/// 先写入同目录下的临时文件, 成功后再重命名, 因此失败时不会留下不完整的归档.
pub fn write_vois<P: AsRef<Path>>(path: P, images: &ZoneImages) -> GradingResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = partial_path(path);
    let written = (|| -> GradingResult<()> {
        let file = File::create(&tmp)?;
        let mut npz = NpzWriter::new(file);
        for zone in Zone::ALL {
            npz.add_array(zone.name(), images.zone(zone))?;
        }
        npz.finish()?;
        Ok(())
    })();
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path).map_err(GradingError::from)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    debug!("wrote {}", path.display());
    Ok(())
}

/// 读取 `path` 中三个分区的特征图像.
pub fn read_vois<P: AsRef<Path>>(path: P) -> GradingResult<ZoneImages> {
    let mut archive = VoiArchive::open(path)?;
    Ok(ZoneImages {
        surf: archive.zone(Zone::Surf)?,
        deep: archive.zone(Zone::Deep)?,
        calc: archive.zone(Zone::Calc)?,
    })
}

/// 已打开的特征图像归档.
pub struct VoiArchive {
    path: PathBuf,
    reader: NpzReader<File>,
}

impl VoiArchive {
    /// 打开归档.
    pub fn open<P: AsRef<Path>>(path: P) -> GradingResult<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| GradingError::load_failure(&path, e))?;
        let reader = NpzReader::new(file).map_err(|e| GradingError::load_failure(&path, e))?;
        Ok(Self { path, reader })
    }

    /// 归档包含的数组名.
    pub fn names(&mut self) -> GradingResult<Vec<String>> {
        Ok(self.reader.names()?)
    }

    /// 读取指定分区. 兼容带或不带 `.npy` 后缀的数组名.
    pub fn zone(&mut self, zone: Zone) -> GradingResult<Array2<f64>> {
        let name = zone.name();
        match self.reader.by_name::<OwnedRepr<f64>, Ix2>(name) {
            Ok(arr) => Ok(arr),
            Err(ReadNpzError::Zip(_)) => self
                .reader
                .by_name::<OwnedRepr<f64>, Ix2>(&format!("{name}.npy"))
                .map_err(|e| GradingError::load_failure(&self.path, format!("`{name}`: {e}"))),
            Err(e) => Err(e.into()),
        }
    }
}
