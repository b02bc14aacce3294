use crate::consts::label::*;
use crate::Idx2d;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::iter::{IndexedIter, Iter, IterMut};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Ix2};
use std::io::{Read, Write};
use std::ops::{Index, IndexMut};

/// 不可变、借用的二维水平标量切片.
pub struct ScalarSlice<'a> {
    /// 底层数据的轻量级视图, 借用于 [`crate::ScalarVolume`].
    ///
    /// 这里有意把代码写死为 `ArrayView` 降低灵活性, 但使结构的意图更加明确.
    data: ArrayView2<'a, f32>,
}

impl Index<Idx2d> for ScalarSlice<'_> {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl<'a> ScalarSlice<'a> {
    #[inline]
    pub(crate) fn new(data: ArrayView2<'a, f32>) -> Self {
        Self { data }
    }

    /// 获取切片形状 `(height, width)`.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 获取切片像素个数.
    #[inline]
    pub fn size(&self) -> usize {
        let (h, w) = self.shape();
        h * w
    }

    /// 获取给定位置 (高, 宽) 的像素值. 越界时返回 `None`.
    #[inline]
    pub fn get(&self, pos: Idx2d) -> Option<&f32> {
        self.data.get(pos)
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, f32, Ix2> {
        self.data.iter()
    }

    /// 获取按行优先序迭代 (索引, 像素) 的迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> IndexedIter<'_, f32, Ix2> {
        self.data.indexed_iter()
    }
}

/// 可变、借用的二维水平标量切片.
pub struct ScalarSliceMut<'a> {
    /// 底层数据的轻量级视图, 借用于 [`crate::ScalarVolume`].
    data: ArrayViewMut2<'a, f32>,
}

impl Index<Idx2d> for ScalarSliceMut<'_> {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx2d> for ScalarSliceMut<'_> {
    #[inline]
    fn index_mut(&mut self, index: Idx2d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<'a> ScalarSliceMut<'a> {
    #[inline]
    pub(crate) fn new(data: ArrayViewMut2<'a, f32>) -> Self {
        Self { data }
    }

    /// 获取切片形状 `(height, width)`.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, f32, Ix2> {
        self.data.iter()
    }

    /// 获取按行优先序迭代 (索引, 像素) 的迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> IndexedIter<'_, f32, Ix2> {
        self.data.indexed_iter()
    }

    /// 获取可以迭代并修改像素的迭代器.
    #[inline]
    pub fn iter_mut(&mut self) -> IterMut<'_, f32, Ix2> {
        self.data.iter_mut()
    }

    /// 将整个切片填充为 `value`.
    #[inline]
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }
}

/// 不可变、借用的二维水平标签切片.
pub struct LabelSlice<'a> {
    /// 底层数据的轻量级视图, 借用于 [`crate::LabelVolume`].
    data: ArrayView2<'a, u32>,
}

impl Index<Idx2d> for LabelSlice<'_> {
    type Output = u32;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl<'a> LabelSlice<'a> {
    #[inline]
    pub(crate) fn new(data: ArrayView2<'a, u32>) -> Self {
        Self { data }
    }

    /// 获取切片形状 `(height, width)`.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 获取切片像素个数.
    #[inline]
    pub fn size(&self) -> usize {
        let (h, w) = self.shape();
        h * w
    }

    /// 获取给定位置 (高, 宽) 的像素值. 越界时返回 `None`.
    #[inline]
    pub fn get(&self, pos: Idx2d) -> Option<&u32> {
        self.data.get(pos)
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, u32, Ix2> {
        self.data.iter()
    }

    /// 获取按行优先序迭代 (索引, 像素) 的迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> IndexedIter<'_, u32, Ix2> {
        self.data.indexed_iter()
    }

    /// 获取切片中值为 `label` 的像素个数.
    #[inline]
    pub fn count(&self, label: u32) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 切片是否是全背景?
    #[inline]
    pub fn is_background(&self) -> bool {
        self.data.iter().all(|p| is_background(*p))
    }

    /// 提取该切片的快速镜像.
    #[inline]
    pub fn mirror(&self) -> LabelMirror {
        LabelMirror::from(self)
    }
}

/// 可变、借用的二维水平标签切片.
pub struct LabelSliceMut<'a> {
    /// 底层数据的轻量级视图, 借用于 [`crate::LabelVolume`].
    data: ArrayViewMut2<'a, u32>,
}

impl Index<Idx2d> for LabelSliceMut<'_> {
    type Output = u32;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx2d> for LabelSliceMut<'_> {
    #[inline]
    fn index_mut(&mut self, index: Idx2d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<'a> LabelSliceMut<'a> {
    #[inline]
    pub(crate) fn new(data: ArrayViewMut2<'a, u32>) -> Self {
        Self { data }
    }

    /// 获取切片形状 `(height, width)`.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, u32, Ix2> {
        self.data.iter()
    }

    /// 获取按行优先序迭代 (索引, 像素) 的迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> IndexedIter<'_, u32, Ix2> {
        self.data.indexed_iter()
    }

    /// 获取可以迭代并修改像素的迭代器.
    #[inline]
    pub fn iter_mut(&mut self) -> IterMut<'_, u32, Ix2> {
        self.data.iter_mut()
    }

    /// 获取给定位置 (高, 宽) 的像素值, 并可就地修改. 越界时返回 `None`.
    #[inline]
    pub fn get_mut(&mut self, pos: Idx2d) -> Option<&mut u32> {
        self.data.get_mut(pos)
    }

    /// 将切片中值为 `old` 的像素全部替换为 `new`.
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

    /// 将 `it` 给出的所有位置填充为 `value`.
    ///
    /// 如果存在越界索引, 则程序 panic.
    pub fn fill_batch<I: IntoIterator<Item = Idx2d>>(&mut self, it: I, value: u32) {
        for pos in it.into_iter() {
            self.data[pos] = value;
        }
    }

    /// 提取该切片的快速镜像.
    #[inline]
    pub fn mirror(&self) -> LabelMirror {
        LabelMirror(self.data.iter().copied().collect())
    }

    /// 用 `mirror` 覆写原本 `self` 的内容.
    ///
    /// 如果 `mirror` 大小与 `self` 不符, 则程序 panic.
    pub fn resume(&mut self, mirror: &LabelMirror) {
        assert_eq!(
            self.data.len(),
            mirror.0.len(),
            "镜像大小不符"
        );
        for (r, w) in mirror.0.iter().zip(self.data.iter_mut()) {
            *w = *r;
        }
    }
}

/// 一个拥有所有权的标签水平切片的不透明镜像.
/// 用于临时保存一个水平标签切片的值, 并在随后恢复.
///
/// 注意该结构是被设计来 **快速** 回填原数据的, 因此并不压缩原数据.
#[derive(Clone, Debug)]
pub struct LabelMirror(pub(crate) Vec<u32>);

impl From<&LabelSlice<'_>> for LabelMirror {
    fn from(value: &LabelSlice<'_>) -> Self {
        Self(value.iter().copied().collect())
    }
}

/// 拥有所有权的二维水平标签切片.
///
/// 通常由 [`CompactLabelSlice::decode`] 解压得到.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedLabelSlice {
    data: Array2<u32>,
}

impl Index<Idx2d> for OwnedLabelSlice {
    type Output = u32;

    #[inline]
    fn index(&self, index: Idx2d) -> &Self::Output {
        &self.data[index]
    }
}

impl OwnedLabelSlice {
    /// 获取切片形状 `(height, width)`.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.data.dim()
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, u32> {
        self.data.view()
    }

    /// 获取按行优先序迭代像素的迭代器.
    #[inline]
    pub fn iter(&self) -> Iter<'_, u32, Ix2> {
        self.data.iter()
    }
}

/// zlib 压缩存储的标签水平切片.
///
/// 实例标签切片大部分是背景, 压缩率很高, 适合为整个标签体保留
/// 低内存占用的快照 (例如精化前后的差异对比).
#[derive(Clone, Debug)]
pub struct CompactLabelSlice {
    shape: Idx2d,
    bytes: Vec<u8>,
}

impl From<&LabelSlice<'_>> for CompactLabelSlice {
    fn from(value: &LabelSlice<'_>) -> Self {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::fast());
        for pix in value.iter() {
            // 该 writer 的底层是 `Vec`, 写入不会失败.
            enc.write_all(&pix.to_le_bytes()).unwrap();
        }
        Self {
            shape: value.shape(),
            bytes: enc.finish().unwrap(),
        }
    }
}

impl CompactLabelSlice {
    /// 获取切片形状 `(height, width)`.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.shape
    }

    /// 获取压缩后的字节数.
    #[inline]
    pub fn compressed_len(&self) -> usize {
        self.bytes.len()
    }

    /// 解压为拥有所有权的标签切片.
    pub fn decode(&self) -> OwnedLabelSlice {
        let (h, w) = self.shape;
        let mut raw = Vec::with_capacity(h * w * 4);
        ZlibDecoder::new(self.bytes.as_slice())
            .read_to_end(&mut raw)
            .unwrap();
        debug_assert_eq!(raw.len(), h * w * 4);

        let pixels: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        OwnedLabelSlice {
            // 长度在上面已经对齐, 不会失败.
            data: Array2::from_shape_vec((h, w), pixels).unwrap(),
        }
    }

    /// 与一个水平切片逐像素对比, 返回取值不同的位置集合.
    ///
    /// 形状不一致时程序 panic.
    pub fn diff(&self, other: &LabelSlice<'_>) -> Vec<Idx2d> {
        assert_eq!(self.shape, other.shape(), "切片形状不一致");
        let decoded = self.decode();
        decoded
            .view()
            .indexed_iter()
            .zip(other.iter())
            .filter_map(|((pos, a), b)| (a != b).then_some(pos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LabelVolume;
    use ndarray::array;

    fn sample_volume() -> LabelVolume {
        let data = array![[[0u32, 1, 0], [2, 2, 0]], [[0, 0, 0], [0, 7, 7]]];
        LabelVolume::from_array(data, [1.0; 3])
    }

    #[test]
    fn test_mirror_roundtrip() {
        let mut v = sample_volume();
        let before = v.slice_at(0).mirror();

        let mut sli = v.slice_at_mut(0);
        sli.fill_batch([(0, 0), (1, 2)], 9);
        assert_eq!(sli[(0, 0)], 9);

        sli.resume(&before);
        assert_eq!(sli[(0, 0)], 0);
        assert_eq!(sli[(1, 2)], 0);
    }

    #[test]
    fn test_compact_roundtrip() {
        let v = sample_volume();
        let compact = CompactLabelSlice::from(&v.slice_at(1));
        let owned = compact.decode();

        assert_eq!(owned.shape(), (2, 3));
        assert!(owned.iter().eq(v.slice_at(1).iter()));
    }

    #[test]
    fn test_compact_diff() {
        let mut v = sample_volume();
        let snapshot = CompactLabelSlice::from(&v.slice_at(1));

        v.slice_at_mut(1).replace(7, 3);
        let changed = snapshot.diff(&v.slice_at(1));
        assert_eq!(changed, vec![(1, 1), (1, 2)]);
    }

    #[test]
    fn test_slice_statistics() {
        let v = sample_volume();
        let sli = v.slice_at(0);
        assert_eq!(sli.count(2), 2);
        assert!(!sli.is_background());
        assert!(v.slice_at(1).get((2, 0)).is_none());
    }
}
