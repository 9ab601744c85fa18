//! 像素元素类型.

use ndarray_npy::{ReadableElement, WritableElement};

/// 存储中像素的数值类型. 名称遵循 numpy 的 dtype 命名.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DType {
    /// `int8`.
    I8,

    /// `uint8`.
    U8,

    /// `int16`.
    I16,

    /// `uint16`.
    U16,

    /// `int32`.
    I32,

    /// `uint32`.
    U32,

    /// `int64`.
    I64,

    /// `uint64`.
    U64,

    /// `float32`.
    F32,

    /// `float64`.
    F64,
}

impl DType {
    /// 全部支持的类型.
    pub const ALL: [Self; 10] = [
        Self::I8,
        Self::U8,
        Self::I16,
        Self::U16,
        Self::I32,
        Self::U32,
        Self::I64,
        Self::U64,
        Self::F32,
        Self::F64,
    ];

    /// 从 dtype 名 (或小端 npy 描述符) 解析. 无法识别时返回 `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int8" | "i8" | "|i1" => Some(Self::I8),
            "uint8" | "u8" | "|u1" => Some(Self::U8),
            "int16" | "i16" | "<i2" => Some(Self::I16),
            "uint16" | "u16" | "<u2" => Some(Self::U16),
            "int32" | "i32" | "<i4" => Some(Self::I32),
            "uint32" | "u32" | "<u4" => Some(Self::U32),
            "int64" | "i64" | "<i8" => Some(Self::I64),
            "uint64" | "u64" | "<u8" => Some(Self::U64),
            "float32" | "f32" | "<f4" => Some(Self::F32),
            "float64" | "f64" | "<f8" => Some(Self::F64),
            _ => None,
        }
    }

    /// numpy 风格的 dtype 名.
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::I8 => "int8",
            Self::U8 => "uint8",
            Self::I16 => "int16",
            Self::U16 => "uint16",
            Self::I32 => "int32",
            Self::U32 => "uint32",
            Self::I64 => "int64",
            Self::U64 => "uint64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    /// 单个元素占用的字节数.
    #[inline]
    pub const fn size_of(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

/// 可以存放在 plate 中、也可以作为内存缓存元素的像素类型.
///
/// 读出的数据总是先转换为 `f32`; 写入缓存时再从 `f32` 转换回来.
/// 整数类型的 `from_f32` 是饱和转换.
pub trait Element:
    Copy + Default + Send + Sync + ReadableElement + WritableElement + 'static
{
    /// 对应的 dtype.
    const DTYPE: DType;

    /// 转为 `f32`.
    fn to_f32(self) -> f32;

    /// 从 `f32` 转换.
    fn from_f32(v: f32) -> Self;
}

macro_rules! impl_element {
    ($($t: ty => $d: ident),+) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$d;

                #[inline]
                fn to_f32(self) -> f32 {
                    self as f32
                }

                #[inline]
                fn from_f32(v: f32) -> Self {
                    v as $t
                }
            }
        )+
    };
}

impl_element!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64
);

/// 按运行时的 [`DType`] 选择具体元素类型 `$t`, 然后求值 `$body`.
macro_rules! with_element {
    ($dtype: expr, $t: ident => $body: expr) => {
        match $dtype {
            $crate::store::DType::I8 => {
                type $t = i8;
                $body
            }
            $crate::store::DType::U8 => {
                type $t = u8;
                $body
            }
            $crate::store::DType::I16 => {
                type $t = i16;
                $body
            }
            $crate::store::DType::U16 => {
                type $t = u16;
                $body
            }
            $crate::store::DType::I32 => {
                type $t = i32;
                $body
            }
            $crate::store::DType::U32 => {
                type $t = u32;
                $body
            }
            $crate::store::DType::I64 => {
                type $t = i64;
                $body
            }
            $crate::store::DType::U64 => {
                type $t = u64;
                $body
            }
            $crate::store::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::store::DType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use with_element;
