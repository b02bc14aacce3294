//! 图像的持久化存储.

use super::{LabelSlice, LabelSliceMut, ScalarSlice, ScalarSliceMut};
use image::ImageResult;
use std::path::Path;

/// 表明一个可以通过 **可视化友好** 模式持久化存储的图像对象.
///
/// `ImgWriteVis` trait 的意图是, 图像将以 "可视化友好" 的方式保存,
/// 而不是 "as is" 的方式. 对于 `LabelSlice`, `LabelSliceMut`
/// 这类实例 id 图像, 保存时会将 id 打散映射到肉眼较易区分的灰度;
/// 对于 `ScalarSlice`, `ScalarSliceMut` 这类概率图像,
/// 保存时会把 \[0, 1\] 区间线性拉伸到 8-bit 灰度.
pub trait ImgWriteVis {
    /// 按照一定的可视化规则将图片保存到 `path` 路径.
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 表明一个可以通过 **按原样** 模式持久化存储的图像对象.
///
/// `ImgWriteRaw` trait 的额外意图是, 图像将按原样保存. 这只对
/// `LabelSlice`, `LabelSliceMut` 这类整数图像有意义, 且要求实例 id
/// 不超过 255; 面对以连续概率存储的标量切片无能为力.
pub trait ImgWriteRaw {
    /// 按原样将图片保存到 `path` 路径.
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 使实例 id 更有利于单通道可视化.
///
/// 背景映射为黑色; 相邻 id 用乘法散列打散到 \[64, 255\] 区间,
/// 避免相邻实例灰度过于接近.
#[inline]
pub(crate) fn pretty(label: u32) -> u8 {
    use crate::consts::gray::*;

    if crate::consts::label::is_background(label) {
        return BLACK;
    }
    let spread = (label.wrapping_mul(2_654_435_761) >> 24) as u8;
    spread | 0b_0100_0000
}

/// 概率值到 8-bit 灰度. 越界值被钳制到区间端点.
#[inline]
pub(crate) fn prob_to_gray(p: f32) -> u8 {
    use crate::consts::gray::*;

    if !p.is_finite() || p <= 0.0 {
        BLACK
    } else if p >= 1.0 {
        WHITE
    } else {
        (p * 255.0) as u8
    }
}

macro_rules! impl_label_vis {
    ($($slice: ty),+) => {
        $(
            /// 背景为黑色, 实例 id 打散为可区分的灰度.
            impl ImgWriteVis for $slice {
                fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
                    let (height, width) = self.shape();
                    let mut buf = image::GrayImage::new(width as u32, height as u32);
                    for ((h, w), &pix) in self.indexed_iter() {
                        buf.put_pixel(w as u32, h as u32, image::Luma([pretty(pix)]));
                    }
                    buf.save(path)
                }
            }
        )+
    };
}

macro_rules! impl_label_raw {
    ($($slice: ty),+) => {
        $(
            /// 按原样存储. 实例 id 超过 255 时程序 panic.
            impl ImgWriteRaw for $slice {
                fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
                    let (height, width) = self.shape();
                    let mut buf = image::GrayImage::new(width as u32, height as u32);
                    for ((h, w), &pix) in self.indexed_iter() {
                        assert!(pix <= u8::MAX as u32, "实例 id `{pix}` 超出 8-bit 范围");
                        buf.put_pixel(w as u32, h as u32, image::Luma([pix as u8]));
                    }
                    buf.save(path)
                }
            }
        )+
    };
}

macro_rules! impl_scalar_vis {
    ($($slice: ty),+) => {
        $(
            /// \[0, 1\] 概率线性拉伸到 8-bit 灰度.
            impl ImgWriteVis for $slice {
                fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
                    let (height, width) = self.shape();
                    let mut buf = image::GrayImage::new(width as u32, height as u32);
                    for ((h, w), &p) in self.indexed_iter() {
                        buf.put_pixel(w as u32, h as u32, image::Luma([prob_to_gray(p)]));
                    }
                    buf.save(path)
                }
            }
        )+
    };
}

impl_label_vis!(LabelSlice<'_>, LabelSliceMut<'_>);
impl_scalar_vis!(ScalarSlice<'_>, ScalarSliceMut<'_>);
impl_label_raw!(LabelSlice<'_>, LabelSliceMut<'_>);

#[cfg(test)]
mod tests {
    use super::{pretty, prob_to_gray};
    use crate::consts::gray::*;

    #[test]
    fn test_pretty_spreads_ids() {
        assert_eq!(pretty(0), BLACK);
        for id in 1..64u32 {
            assert!(pretty(id) >= 0b_0100_0000);
        }
        // 相邻 id 不应映射到同一灰度.
        assert_ne!(pretty(1), pretty(2));
    }

    #[test]
    fn test_prob_to_gray_clamps() {
        assert_eq!(prob_to_gray(-0.5), BLACK);
        assert_eq!(prob_to_gray(0.0), BLACK);
        assert_eq!(prob_to_gray(1.0), WHITE);
        assert_eq!(prob_to_gray(2.0), WHITE);
        assert_eq!(prob_to_gray(f32::NAN), BLACK);
        assert_eq!(prob_to_gray(0.5), 127);
    }

    #[test]
    fn test_save_roundtrip() {
        use crate::{ImgWriteRaw, LabelVolume};
        use ndarray::array;

        let v = LabelVolume::from_array(array![[[0u32, 1], [2, 3]]], [1.0; 3]);
        let mut path = std::env::temp_dir();
        path.push("vox_berry_save_roundtrip.png");

        v.slice_at(0).save_raw(&path).unwrap();
        let img = image::open(&path).unwrap().into_luma8();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(1, 1).0, [3]);

        let _ = std::fs::remove_file(path);
    }
}
