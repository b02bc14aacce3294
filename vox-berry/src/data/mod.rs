use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array3, ArrayView, ArrayViewMut, Axis, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::label::*;
use crate::{Idx2d, Idx3d, LabelPredicate};

pub mod slice;

pub use slice::{
    CompactLabelSlice, ImgWriteRaw, ImgWriteVis, LabelMirror, LabelSlice, LabelSliceMut,
    OwnedLabelSlice, ScalarSlice, ScalarSliceMut,
};

/// 体数据的物理元信息: 形状, 体素间距和原点偏移.
///
/// 所有空间量都以 `(z, height, width)` 顺序组织, 单位为毫米.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMeta {
    shape: Idx3d,
    spacing: [f64; 3],
    origin: [f64; 3],
}

impl VolumeMeta {
    /// 构建元信息.
    ///
    /// 形状各维与间距各分量必须为正, 否则程序 panic.
    pub fn new(shape: Idx3d, spacing: [f64; 3], origin: [f64; 3]) -> Self {
        assert!(shape.0 > 0 && shape.1 > 0 && shape.2 > 0, "形状各维必须为正");
        assert!(
            spacing.iter().all(|s| s.is_finite() && *s > 0.0),
            "间距各分量必须为正"
        );
        Self {
            shape,
            spacing,
            origin,
        }
    }

    /// 构建各向同性 (间距 1mm), 原点为零的元信息. 合成数据常用.
    #[inline]
    pub fn isotropic(shape: Idx3d) -> Self {
        Self::new(shape, [1.0; 3], [0.0; 3])
    }

    /// 数据形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 各轴体素间距, 单位毫米, `(z, h, w)` 顺序.
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// 世界坐标系下的原点偏移, 单位毫米, `(z, h, w)` 顺序.
    #[inline]
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// 从 nifti header 中提取元信息.
    ///
    /// nifti 按 \[W, H, z\] 组织维度信息, 这里统一转换为 `(z, H, W)`.
    fn from_nifti(h: &NiftiHeader) -> Self {
        let [_, w, h_dim, z, ..] = h.dim;
        let [_, pw, ph, pz, ..] = h.pixdim;
        Self::new(
            (z as usize, h_dim as usize, w as usize),
            [pz as f64, ph as f64, pw as f64],
            [h.quatern_z as f64, h.quatern_y as f64, h.quatern_x as f64],
        )
    }
}

/// 3D 体数据元信息的共用属性和部分通用操作.
pub trait VolumeMetaAttr {
    /// 获取元信息部分.
    fn meta(&self) -> &VolumeMeta;

    /// 获取数据形状大小.
    #[inline]
    fn shape(&self) -> Idx3d {
        self.meta().shape
    }

    /// 获取数据水平切片形状大小.
    #[inline]
    fn slice_shape(&self) -> Idx2d {
        let (_, h, w) = self.shape();
        (h, w)
    }

    /// 获取水平切片个数.
    #[inline]
    fn len_z(&self) -> usize {
        self.shape().0
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    ///
    /// 该值也可以通过 `self.{z_mm, height_mm, width_mm}` 分别获取.
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        self.meta().spacing
    }

    /// 获取 width 方向 (自然 2D 图像的水平方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn width_mm(&self) -> f64 {
        self.meta().spacing[2]
    }

    /// 获取 height 方向 (自然 2D 图像的垂直方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn height_mm(&self) -> f64 {
        self.meta().spacing[1]
    }

    /// 获取空间方向 (相邻 2D 切片的方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn z_mm(&self) -> f64 {
        self.meta().spacing[0]
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    fn is_isotropic(&self) -> bool {
        let [z, h, w] = self.pix_dim();
        z == h && z == w
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }

    /// 获取水平切片方向的像素实际面积值, 以平方毫米为单位.
    #[inline]
    fn slice_pixel(&self) -> f64 {
        self.pix_dim().iter().skip(1).product()
    }

    /// 获取体数据在世界坐标系下的原点偏移, 以毫米为单位, `(z, h, w)` 顺序.
    #[inline]
    fn origin_mm(&self) -> [f64; 3] {
        self.meta().origin
    }
}

/// 3D 标量体数据, 体素值以 `f32` 保存.
///
/// 该结构既可承载原始荧光强度体, 也可承载模型推理拼接后的概率体.
/// 两种角色共用同一套几何与切片操作.
#[derive(Debug, Clone)]
pub struct ScalarVolume {
    meta: VolumeMeta,
    data: Array3<f32>,
}

impl VolumeMetaAttr for ScalarVolume {
    #[inline]
    fn meta(&self) -> &VolumeMeta {
        &self.meta
    }
}

impl Index<Idx3d> for ScalarVolume {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for ScalarVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl ScalarVolume {
    /// 打开 nii 文件格式的 3D 标量体. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let meta = VolumeMeta::from_nifti(obj.header());

        // [W, H, z] -> [z, H, W].
        // hint: 原第一维向下增长, 原第二维向右增长.
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .permuted_axes([2, 1, 0].as_slice());

        // The nature of nifti data field layout.
        debug_assert!(data.is_standard_layout());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data = Array3::<f32>::from_shape_vec(meta.shape, data.into_raw_vec()).unwrap();

        Ok(Self { meta, data })
    }

    /// 从裸数据和元信息直接创建实体.
    ///
    /// `data` 按 `(z, h, w)` 组织. 形状与 `meta` 不符时程序 panic.
    pub fn from_parts(meta: VolumeMeta, data: Array3<f32>) -> Self {
        assert_eq!(meta.shape, data.dim(), "数据形状与元信息不符");
        Self { meta, data }
    }

    /// 从裸数据和体素间距直接创建实体, 原点偏移为零.
    #[inline]
    pub fn from_array(data: Array3<f32>, spacing: [f64; 3]) -> Self {
        let meta = VolumeMeta::new(data.dim(), spacing, [0.0; 3]);
        Self { meta, data }
    }

    /// 获取全体有限体素值的取值范围 `(min, max)`.
    ///
    /// 非有限值 (inf, NaN) 不参与统计. 若不存在有限值则返回 `None`.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        let mut range: Option<(f32, f32)> = None;
        for &v in self.data.iter().filter(|v| v.is_finite()) {
            range = Some(match range {
                None => (v, v),
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
            });
        }
        range
    }

    /// 获取 z 空间的第 `z_index` 层切片视图.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at(&self, z_index: usize) -> ScalarSlice<'_> {
        ScalarSlice::new(self.data.index_axis(Axis(0), z_index))
    }

    /// 获取 z 空间的第 `z_index` 层可变切片视图.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at_mut(&mut self, z_index: usize) -> ScalarSliceMut<'_> {
        ScalarSliceMut::new(self.data.index_axis_mut(Axis(0), z_index))
    }

    /// 获取能按升序迭代水平不可变切片的迭代器.
    #[inline]
    pub fn slice_iter(&self) -> impl ExactSizeIterator<Item = ScalarSlice> {
        self.data.axis_iter(Axis(0)).map(ScalarSlice::new)
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, f32, Ix3> {
        self.data.view_mut()
    }
}

/// 3D 实例标签体, 体素值以 `u32` 保存.
///
/// 0 为背景, 每个正值标识一个实例. 标签的连通一致性由
/// [`crate::labeling`] 的标注过程保证, 精化阶段按策略拆分/合并.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    meta: VolumeMeta,
    data: Array3<u32>,
}

impl VolumeMetaAttr for LabelVolume {
    #[inline]
    fn meta(&self) -> &VolumeMeta {
        &self.meta
    }
}

impl Index<Idx3d> for LabelVolume {
    type Output = u32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for LabelVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl LabelVolume {
    /// 打开 nii 文件格式的 3D 标签体. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    ///
    /// # 注意
    ///
    /// 标签在 nii 文件中按 `u16` 存储 (实例数不超过 65535),
    /// 读入后加宽为 `u32`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let meta = VolumeMeta::from_nifti(obj.header());

        // [W, H, z] -> [z, H, W].
        let data = obj
            .into_volume()
            .into_ndarray::<u16>()?
            .permuted_axes([2, 1, 0].as_slice());

        // The nature of nifti data field layout.
        debug_assert!(data.is_standard_layout());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data = Array3::<u16>::from_shape_vec(meta.shape, data.into_raw_vec()).unwrap();

        Ok(Self {
            meta,
            data: data.mapv(u32::from),
        })
    }

    /// 创建全背景标签体.
    #[inline]
    pub fn zeros(meta: VolumeMeta) -> Self {
        let data = Array3::zeros(meta.shape);
        Self { meta, data }
    }

    /// 从裸数据和元信息直接创建实体.
    ///
    /// `data` 按 `(z, h, w)` 组织. 形状与 `meta` 不符时程序 panic.
    pub fn from_parts(meta: VolumeMeta, data: Array3<u32>) -> Self {
        assert_eq!(meta.shape, data.dim(), "数据形状与元信息不符");
        Self { meta, data }
    }

    /// 从裸数据和体素间距直接创建实体, 原点偏移为零.
    #[inline]
    pub fn from_array(data: Array3<u32>, spacing: [f64; 3]) -> Self {
        let meta = VolumeMeta::new(data.dim(), spacing, [0.0; 3]);
        Self { meta, data }
    }

    /// 获取 z 空间的第 `z_index` 层不可变切片.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at(&self, z_index: usize) -> LabelSlice {
        LabelSlice::new(self.data.index_axis(Axis(0), z_index))
    }

    /// 获取 z 空间的第 `z_index` 层可变切片.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at_mut(&mut self, z_index: usize) -> LabelSliceMut {
        LabelSliceMut::new(self.data.index_axis_mut(Axis(0), z_index))
    }

    /// 获取能按升序迭代水平不可变切片的迭代器.
    #[inline]
    pub fn slice_iter(&self) -> impl ExactSizeIterator<Item = LabelSlice> {
        self.data.axis_iter(Axis(0)).map(LabelSlice::new)
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u32, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, u32, Ix3> {
        self.data.view_mut()
    }

    /// 获取标签体中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u32) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 将标签体中值为 `old` 的体素全部替换为 `new`.
    ///
    /// 返回总共成功替换的个数.
    pub fn replace(&mut self, old: u32, new: u32) -> usize {
        let mut cnt = 0usize;
        self.data
            .iter_mut()
            .filter(|pix| **pix == old)
            .for_each(|p| {
                cnt += 1;
                *p = new;
            });
        cnt
    }

    /// 收集满足谓词 `pred` 的所有体素对应的下标, 结果按行优先存储.
    pub fn filter_pos(&self, pred: LabelPredicate) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(ref pos, pixel)| pred(*pixel).then_some(*pos))
            .collect()
    }

    /// 按升序收集标签体中出现过的全部实例 id (不含背景).
    pub fn instance_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .instance_sizes()
            .into_keys()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// 统计每个实例的体素个数 (不含背景).
    pub fn instance_sizes(&self) -> HashMap<u32, usize> {
        let mut sizes = HashMap::new();
        for &v in self.data.iter().filter(|v| is_instance(**v)) {
            *sizes.entry(v).or_insert(0) += 1;
        }
        sizes
    }

    /// 获取当前最大的实例 id. 全背景时返回 `BACKGROUND`.
    #[inline]
    pub fn max_label(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(BACKGROUND)
    }

    /// 按切片压缩整个标签体, 作为低内存占用的快照.
    ///
    /// 快照与原体数据相互独立, 可用于精化前后的差异对比.
    pub fn compact_snapshot(&self) -> Vec<CompactLabelSlice> {
        self.slice_iter().map(|s| CompactLabelSlice::from(&s)).collect()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 并发操作部分
#[cfg(feature = "rayon")]
impl ScalarVolume {
    /// 借助 `rayon`, 并行地对每个水平不可变切片实施 `op` 操作.
    /// 该操作会同时携带 z 方向索引信息.
    pub fn par_for_each_indexed_slice<F>(&self, op: F)
    where
        F: Fn(usize, ScalarSlice) + Sync + Send,
    {
        self.data()
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, v)| {
                op(i, ScalarSlice::new(v));
            });
    }
}

/// 并发操作部分
#[cfg(feature = "rayon")]
impl LabelVolume {
    /// 借助 `rayon`, 并行地将标签体中值为 `old` 的体素全部替换为 `new`.
    ///
    /// 返回总共成功替换的个数.
    pub fn par_replace(&mut self, old: u32, new: u32) -> usize {
        let cnt = AtomicUsize::new(0);
        self.data_mut()
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|v| {
                let mut sli = LabelSliceMut::new(v);
                let local = sli.replace(old, new);
                cnt.fetch_add(local, Ordering::Release);
            });

        cnt.load(Ordering::Acquire)
    }
}

/// 3D 标量体与对应的实例标签体.
///
/// 该结构完全透明, 仅包含两个公开的 `scalar` 和 `label` 子结构,
/// 用户可以直接使用它们来实现相关上层功能.
///
/// # 注意
///
/// 两个子结构的数据一致性由用户保证, 否则程序行为未定义.
#[derive(Debug, Clone)]
pub struct VolumePair {
    /// 3D 标量体 (原始强度或概率).
    pub scalar: ScalarVolume,

    /// 3D 实例标签体.
    pub label: LabelVolume,
}

impl VolumePair {
    /// 分别打开 nii 文件格式的标量体和对应标签体. 如果任一文件打开失败,
    /// 则返回 `Err`. 若两个文件的数据形状不一致, 则程序 `panic`.
    pub fn open(
        scalar_path: impl AsRef<Path>,
        label_path: impl AsRef<Path>,
    ) -> nifti::Result<Self> {
        let scalar = ScalarVolume::open(scalar_path.as_ref())?;
        let label = LabelVolume::open(label_path.as_ref())?;
        assert_eq!(scalar.shape(), label.shape(), "标量体和标签体形状不一致");
        Ok(Self { scalar, label })
    }

    /// 获取水平切片个数.
    #[inline]
    pub fn len_z(&self) -> usize {
        self.label.len_z()
    }

    /// 依次获取标量体和标签体 z 空间的第 `z_index` 层不可变切片.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at(&self, z_index: usize) -> (ScalarSlice<'_>, LabelSlice<'_>) {
        (self.scalar.slice_at(z_index), self.label.slice_at(z_index))
    }

    /// 获取能按行优先序迭代 (标量, 标签) 体素的迭代器.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&f32, &u32)> {
        self.scalar.data.iter().zip(self.label.data.iter())
    }
}
