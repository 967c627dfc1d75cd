//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d};

pub use crate::data::{BoundingBox, Mask, Volume, VoxelGrid};
pub use crate::{GradingConfig, GradingError, GradingResult};

pub use crate::consts::gray::{MASK_BACKGROUND, MASK_FOREGROUND};

pub use crate::crop::{CropMethod, CropWindow};
pub use crate::orient::{Angles, OrientMethod, Orientation};
pub use crate::segment::{FnSegmenter, KMeansSegmenter, PrecomputedSegmenter, Segmenter};
pub use crate::voi::{DeepDepth, Vois, Zone};

pub use crate::meanstd::{MeanStd, ZoneImages};
pub use crate::pca::{FeatureFit, NComponents, Pca};
pub use crate::regression::{CvOutcome, GradeTransform, Model, ModelKind, Split};
pub use crate::weights::{BinaryWeights, GradingModel};

pub use crate::dataset::home_dataset_dir_with;
pub use crate::dataset::{self, Aggregate, GradeTable};
pub use crate::pipeline::{process_batch, process_sample, train_and_evaluate};
