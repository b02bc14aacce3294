//! 水平切片视图.
//!
//! 提供标量体/标签体在某一 z 层上的轻量级借用视图, 以及与之配套的
//! 镜像 (备份/恢复), 压缩快照和持久化存储工具.

mod core;
mod save;

pub use core::{
    CompactLabelSlice, LabelMirror, LabelSlice, LabelSliceMut, OwnedLabelSlice, ScalarSlice,
    ScalarSliceMut,
};
pub use save::{ImgWriteRaw, ImgWriteVis};
