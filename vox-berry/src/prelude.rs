//! 🫐欢迎光临🫐
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d};

pub use crate::data::{
    CompactLabelSlice, ImgWriteVis, LabelSlice, LabelSliceMut, LabelVolume, ScalarSlice,
    ScalarSliceMut, ScalarVolume, VolumeMeta, VolumeMetaAttr, VolumePair,
};

pub use crate::consts::label::{is_background, is_instance, BACKGROUND, FIRST_INSTANCE};
pub use crate::consts::ElemType;

pub use crate::error::PipelineError;

pub use crate::tile::{EdgeRule, TileGrid};

pub use crate::infer::{InferenceRunner, Predictor};

pub use crate::stitch::{BlendMode, Stitcher};

pub use crate::labeling::{label_components, Connectivity, LabelParams};

pub use crate::geodesic::{correct, CorrectionReport, CorrectorParams};

pub use crate::metrics::{evaluate, MetricsReport};

pub use crate::pipeline::{run, run_with_truth, PipelineConfig, PipelineOutput};

pub use crate::dataset::{self, home_dataset_dir_with};
