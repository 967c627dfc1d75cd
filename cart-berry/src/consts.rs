//! 通用常量.

/// 单通道颜色.
pub mod gray {
    /// 单通道黑色.
    pub const BLACK: u8 = 0b_0000_0000;

    /// 单通道白色.
    pub const WHITE: u8 = 0b_1111_1111;

    /// 掩膜中的背景值.
    pub const MASK_BACKGROUND: u8 = 0;

    /// 掩膜中的前景值.
    pub const MASK_FOREGROUND: u8 = 1;

    /// 像素是否是合法的掩膜值?
    #[inline]
    pub const fn is_mask_value(p: u8) -> bool {
        matches!(p, MASK_BACKGROUND | MASK_FOREGROUND)
    }

    /// 将掩膜值映射为可视化的灰度值.
    #[inline]
    pub const fn mask_to_gray(p: u8) -> u8 {
        if p == MASK_BACKGROUND {
            BLACK
        } else {
            WHITE
        }
    }
}

/// 包围盒二值化阈值.
pub const BBOX_THRESHOLD: u8 = 80;

/// 包围盒的最小面积 (以像素计), 不超过该值的包围盒视为空.
pub const BBOX_MIN_AREA: usize = 1600;

/// 体数据字节数超过该值时跳过定向.
pub const ORIENT_MAX_BYTES: usize = 3_000_000_000;

/// 切片文件名中, 扩展名前数字序号的位数.
pub const SLICE_INDEX_DIGITS: usize = 3;

/// 支持的切片图像扩展名.
pub const SLICE_EXTENSIONS: [&str; 3] = ["png", "bmp", "tif"];

/// 交叉验证等随机过程的默认种子.
pub const DEFAULT_SEED: u64 = 42;

/// 子体切分: 子体边长.
pub const SUBVOLUME_TILE: usize = 448;

/// 子体切分: 相邻子体起点的间距.
pub const SUBVOLUME_STRIDE: usize = 200;

/// 子体切分: 每个方向上的子体个数.
pub const SUBVOLUME_GRID: usize = 3;
