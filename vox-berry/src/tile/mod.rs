//! 体数据分块 (tiling).
//!
//! patch 坐标网格只由 (体数据形状, patch 形状, 步长, 边缘规则) 决定,
//! 是纯函数式的, 覆盖性可以在不运行推理的情况下单独验证.
//! 逆操作 (把 patch 预测折叠回完整体积) 由 [`crate::stitch`] 负责.

use either::Either;
use ndarray::{s, Array3};

use crate::data::{ScalarVolume, VolumeMetaAttr};
use crate::error::ShapeError;
use crate::Idx3d;

/// patch 越过体数据边缘时的处理规则.
///
/// 两种规则必须在 split 与后续拼接中保持一致.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeRule {
    /// 用给定值把边缘 patch 补齐到完整 patch 形状.
    /// 补齐部分不属于有效范围, 拼接时会被裁掉.
    Pad(f32),

    /// 边缘 patch 直接按体数据边界截断, 形状可能小于完整 patch 形状.
    Truncate,
}

/// patch 坐标网格.
#[derive(Debug, Clone)]
pub struct TileGrid {
    vol_shape: Idx3d,
    patch_shape: Idx3d,
    stride: Idx3d,
    edge: EdgeRule,
}

impl TileGrid {
    /// 构建网格.
    ///
    /// `patch_shape` 和 `stride` 各分量必须为正, 且 `stride` 不得超过
    /// `patch_shape` (相邻 patch 重叠 >= 0), 否则程序 panic.
    ///
    /// # 错误
    ///
    /// 当 `edge` 为 [`EdgeRule::Truncate`] 且某轴上 patch 尺寸超过体数据
    /// 尺寸时, 返回 [`ShapeError`]. `Pad` 规则下超出部分由补齐兜底.
    pub fn new(
        vol_shape: Idx3d,
        patch_shape: Idx3d,
        stride: Idx3d,
        edge: EdgeRule,
    ) -> Result<Self, ShapeError> {
        let vs = [vol_shape.0, vol_shape.1, vol_shape.2];
        let ps = [patch_shape.0, patch_shape.1, patch_shape.2];
        let st = [stride.0, stride.1, stride.2];

        assert!(vs.iter().all(|d| *d > 0), "体数据形状各维必须为正");
        assert!(ps.iter().all(|d| *d > 0), "patch 形状各维必须为正");
        assert!(st.iter().all(|d| *d > 0), "步长各分量必须为正");
        assert!(
            st.iter().zip(ps.iter()).all(|(s, p)| s <= p),
            "步长不得超过 patch 形状"
        );

        if matches!(edge, EdgeRule::Truncate) {
            for axis in 0..3 {
                if ps[axis] > vs[axis] {
                    return Err(ShapeError {
                        axis,
                        expected: vs[axis],
                        actual: ps[axis],
                    });
                }
            }
        }

        Ok(Self {
            vol_shape,
            patch_shape,
            stride,
            edge,
        })
    }

    /// 网格覆盖的体数据形状.
    #[inline]
    pub fn vol_shape(&self) -> Idx3d {
        self.vol_shape
    }

    /// 完整 patch 形状.
    #[inline]
    pub fn patch_shape(&self) -> Idx3d {
        self.patch_shape
    }

    /// 滑动步长.
    #[inline]
    pub fn stride(&self) -> Idx3d {
        self.stride
    }

    /// 边缘规则.
    #[inline]
    pub fn edge(&self) -> EdgeRule {
        self.edge
    }

    /// 单轴上的 patch 起点序列.
    ///
    /// 起点为步长的整数倍; 最后一个起点是第一个满足
    /// `start + patch >= len` 的步长倍数, 由边缘规则负责补齐或截断.
    fn axis_starts(len: usize, patch: usize, stride: usize) -> Vec<usize> {
        debug_assert!(len > 0 && patch > 0 && stride > 0 && stride <= patch);

        if patch >= len {
            return vec![0];
        }
        let mut starts = Vec::with_capacity(len / stride + 1);
        let mut s = 0usize;
        while s + patch < len {
            starts.push(s);
            s += stride;
        }
        starts.push(s);
        starts
    }

    /// 以 z 主序 (z, 再 h, 再 w) 枚举所有 patch 原点.
    ///
    /// 该顺序是确定的栅格序, 也是 `"overwrite"` 融合模式下约定的写入顺序.
    pub fn origins(&self) -> GridIter {
        GridIter::new(
            Self::axis_starts(self.vol_shape.0, self.patch_shape.0, self.stride.0),
            Self::axis_starts(self.vol_shape.1, self.patch_shape.1, self.stride.1),
            Self::axis_starts(self.vol_shape.2, self.patch_shape.2, self.stride.2),
        )
    }

    /// patch 总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.origins().len()
    }

    /// 网格是否为空? 形状各维为正时恒为 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 原点 `origin` 处 patch 的有效范围 (不含补齐部分).
    #[inline]
    pub fn extent_at(&self, (z, h, w): Idx3d) -> Idx3d {
        (
            self.patch_shape.0.min(self.vol_shape.0 - z),
            self.patch_shape.1.min(self.vol_shape.1 - h),
            self.patch_shape.2.min(self.vol_shape.2 - w),
        )
    }

    /// 从体数据中按栅格序切出所有 patch.
    ///
    /// 序列是惰性的, 每个 patch 在被消费时才实际拷贝体素.
    /// `vol` 的形状必须与构建网格时一致, 否则程序 panic.
    pub fn split<'a>(&'a self, vol: &'a ScalarVolume) -> impl Iterator<Item = Patch> + 'a {
        assert_eq!(vol.shape(), self.vol_shape, "体数据形状与网格不一致");

        match self.edge {
            EdgeRule::Pad(fill) => {
                Either::Left(self.origins().map(move |o| self.padded_patch(vol, o, fill)))
            }
            EdgeRule::Truncate => {
                Either::Right(self.origins().map(move |o| self.truncated_patch(vol, o)))
            }
        }
    }

    /// 切出完整 patch 形状的 patch, 越界部分以 `fill` 补齐.
    fn padded_patch(&self, vol: &ScalarVolume, origin: Idx3d, fill: f32) -> Patch {
        let extent = self.extent_at(origin);
        let (z, h, w) = origin;
        let (ez, eh, ew) = extent;

        let mut data = Array3::from_elem(self.patch_shape, fill);
        data.slice_mut(s![..ez, ..eh, ..ew])
            .assign(&vol.data().slice(s![z..z + ez, h..h + eh, w..w + ew]));

        Patch {
            origin,
            extent,
            data,
        }
    }

    /// 切出按体数据边界截断的 patch.
    fn truncated_patch(&self, vol: &ScalarVolume, origin: Idx3d) -> Patch {
        let extent = self.extent_at(origin);
        let (z, h, w) = origin;
        let (ez, eh, ew) = extent;

        Patch {
            origin,
            extent,
            data: vol
                .data()
                .slice(s![z..z + ez, h..h + eh, w..w + ew])
                .to_owned(),
        }
    }
}

/// 栅格序 (z 主序) patch 原点迭代器.
#[derive(Debug, Clone)]
pub struct GridIter {
    zs: Vec<usize>,
    hs: Vec<usize>,
    ws: Vec<usize>,
    cursor: usize,
}

impl GridIter {
    #[inline]
    fn new(zs: Vec<usize>, hs: Vec<usize>, ws: Vec<usize>) -> Self {
        Self {
            zs,
            hs,
            ws,
            cursor: 0,
        }
    }
}

impl Iterator for GridIter {
    type Item = Idx3d;

    fn next(&mut self) -> Option<Self::Item> {
        let (nh, nw) = (self.hs.len(), self.ws.len());
        let total = self.zs.len() * nh * nw;
        if self.cursor == total {
            return None;
        }
        let i = self.cursor;
        self.cursor += 1;
        Some((
            self.zs[i / (nh * nw)],
            self.hs[i / nw % nh],
            self.ws[i % nw],
        ))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.zs.len() * self.hs.len() * self.ws.len() - self.cursor;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for GridIter {}

/// 从体数据中切出的一个 patch.
#[derive(Debug, Clone)]
pub struct Patch {
    origin: Idx3d,
    extent: Idx3d,
    data: Array3<f32>,
}

impl Patch {
    /// patch 原点在父体积中的坐标.
    #[inline]
    pub fn origin(&self) -> Idx3d {
        self.origin
    }

    /// 有效范围 (不含补齐部分).
    #[inline]
    pub fn extent(&self) -> Idx3d {
        self.extent
    }

    /// 体素数据. `EdgeRule::Pad` 下形状恒为完整 patch 形状,
    /// `EdgeRule::Truncate` 下形状等于有效范围.
    #[inline]
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// patch 数据形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScalarVolume;
    use ndarray::Array3;

    fn seq_volume(shape: Idx3d) -> ScalarVolume {
        let (z, h, w) = shape;
        let data =
            Array3::from_shape_vec(shape, (0..z * h * w).map(|v| v as f32).collect()).unwrap();
        ScalarVolume::from_array(data, [1.0; 3])
    }

    /// 用覆盖计数逐体素验证网格的覆盖性.
    fn coverage_counts(grid: &TileGrid) -> Array3<u32> {
        let mut cnt = Array3::<u32>::zeros(grid.vol_shape());
        for origin in grid.origins() {
            let (z, h, w) = origin;
            let (ez, eh, ew) = grid.extent_at(origin);
            cnt.slice_mut(s![z..z + ez, h..h + eh, w..w + ew])
                .mapv_inplace(|c| c + 1);
        }
        cnt
    }

    #[test]
    fn test_full_coverage_with_overlap() {
        let grid = TileGrid::new((7, 9, 11), (4, 4, 4), (2, 3, 4), EdgeRule::Truncate).unwrap();
        assert!(coverage_counts(&grid).iter().all(|c| *c >= 1));
    }

    #[test]
    fn test_exact_coverage_without_overlap() {
        // 步长等于 patch 形状时, 每个体素恰好被覆盖一次.
        let grid = TileGrid::new((8, 8, 9), (4, 4, 4), (4, 4, 4), EdgeRule::Pad(0.0)).unwrap();
        assert!(coverage_counts(&grid).iter().all(|c| *c == 1));
    }

    #[test]
    fn test_origins_raster_order() {
        let grid = TileGrid::new((4, 4, 4), (2, 2, 2), (2, 2, 2), EdgeRule::Truncate).unwrap();
        let origins: Vec<_> = grid.origins().collect();
        assert_eq!(
            origins,
            vec![
                (0, 0, 0),
                (0, 0, 2),
                (0, 2, 0),
                (0, 2, 2),
                (2, 0, 0),
                (2, 0, 2),
                (2, 2, 0),
                (2, 2, 2),
            ]
        );
        assert_eq!(grid.len(), 8);
    }

    #[test]
    fn test_truncate_rejects_oversized_patch() {
        let err = TileGrid::new((4, 4, 4), (4, 8, 4), (1, 1, 1), EdgeRule::Truncate).unwrap_err();
        assert_eq!(err.axis, 1);
        assert_eq!(err.expected, 4);
        assert_eq!(err.actual, 8);

        // Pad 规则下同样的形状是允许的.
        assert!(TileGrid::new((4, 4, 4), (4, 8, 4), (1, 1, 1), EdgeRule::Pad(0.0)).is_ok());
    }

    #[test]
    fn test_padded_patch_contents() {
        let vol = seq_volume((3, 3, 3));
        let grid = TileGrid::new((3, 3, 3), (2, 2, 2), (2, 2, 2), EdgeRule::Pad(-1.0)).unwrap();

        let edge = grid
            .split(&vol)
            .find(|p| p.origin() == (2, 2, 2))
            .unwrap();
        assert_eq!(edge.shape(), (2, 2, 2));
        assert_eq!(edge.extent(), (1, 1, 1));
        assert_eq!(edge.data()[(0, 0, 0)], vol[(2, 2, 2)]);
        assert_eq!(edge.data()[(1, 1, 1)], -1.0);
    }

    #[test]
    fn test_truncated_patch_contents() {
        let vol = seq_volume((3, 3, 3));
        let grid = TileGrid::new((3, 3, 3), (2, 2, 2), (2, 2, 2), EdgeRule::Truncate).unwrap();

        let edge = grid
            .split(&vol)
            .find(|p| p.origin() == (2, 2, 2))
            .unwrap();
        assert_eq!(edge.shape(), (1, 1, 1));
        assert_eq!(edge.data()[(0, 0, 0)], vol[(2, 2, 2)]);
    }
}
