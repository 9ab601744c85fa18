//! 随机仿射变换.

use ndarray::{Array4, ArrayView3, Axis};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::MapTransform;
use crate::dataset::{ChannelImages, Crops};
use crate::error::{ConfigError, TransformError};

type Mat3 = [[f32; 3]; 3];

/// 单个轴上参数的采样区间.
///
/// json 中写成一个数 `r` 时表示 `[-|r|, |r|]`, 写成 `[lo, hi]` 时即为该区间.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisRange {
    /// `[-|r|, |r|]`.
    Symmetric(f32),

    /// `[lo, hi]`.
    Range(f32, f32),
}

impl Default for AxisRange {
    fn default() -> Self {
        Self::Symmetric(0.0)
    }
}

impl AxisRange {
    /// 区间上下界.
    pub fn bounds(&self) -> (f32, f32) {
        match *self {
            Self::Symmetric(r) => (-r.abs(), r.abs()),
            Self::Range(lo, hi) => (lo, hi),
        }
    }

    fn checked(&self, what: &str) -> Result<(f32, f32), ConfigError> {
        let (lo, hi) = self.bounds();
        if lo.is_finite() && hi.is_finite() && lo <= hi {
            Ok((lo, hi))
        } else {
            Err(ConfigError::InvalidTransform(format!(
                "RandAffine: invalid {what} range {self:?}"
            )))
        }
    }
}

fn sample(rng: &mut dyn RngCore, (lo, hi): (f32, f32)) -> f32 {
    if lo < hi {
        rng.random_range(lo..hi)
    } else {
        lo
    }
}

fn matmul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// 在 `(p, q)` 两轴构成的平面内旋转 `angle` 弧度.
fn rotation(p: usize, q: usize, angle: f32) -> Mat3 {
    let (s, c) = angle.sin_cos();
    let mut m = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    m[p][p] = c;
    m[p][q] = -s;
    m[q][p] = s;
    m[q][q] = c;
    m
}

/// 以概率 `prob` 对 `(Z, Y, X)` 空间做随机仿射变换, 输出大小不变.
///
/// 对输出体素 `o`, 从输入坐标 `A (o - c) + c` 处三线性插值取值, 其中 `c` 为图像中心,
/// `A = R · Sh · S`:
///
/// - `R` 依次为绕 Z / Y / X 轴的旋转 (弧度), 角度在 `rotate_range` 内采样;
/// - `Sh` 为上三角剪切, 三个系数依次作用于 `(z, y)`, `(z, x)`, `(y, x)`;
/// - `S = diag(1 + s)`, `s` 在 `scale_range` 内采样. `s > 0` 时图像缩小, 因此
///   需要读取更大的输入范围.
///
/// 越界坐标按边界反射. 同一样本的所有 `keys` 共用一个 `A`.
#[derive(Clone, Debug)]
pub struct RandAffine {
    keys: Vec<String>,
    prob: f32,
    rotate: [(f32, f32); 3],
    shear: [(f32, f32); 3],
    scale: [(f32, f32); 3],
}

impl RandAffine {
    /// 创建变换. 各区间按 `(Z, Y, X)` 排列. 缩放后的倍率必须为正.
    pub fn new(
        keys: Vec<String>,
        prob: f32,
        rotate_range: [AxisRange; 3],
        shear_range: [AxisRange; 3],
        scale_range: [AxisRange; 3],
    ) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&prob) {
            return Err(ConfigError::InvalidTransform(format!(
                "RandAffine: probability {prob} is not in [0, 1]"
            )));
        }
        let mut rotate = [(0.0, 0.0); 3];
        let mut shear = [(0.0, 0.0); 3];
        let mut scale = [(0.0, 0.0); 3];
        for i in 0..3 {
            rotate[i] = rotate_range[i].checked("rotate")?;
            shear[i] = shear_range[i].checked("shear")?;
            scale[i] = scale_range[i].checked("scale")?;
            if scale[i].0 <= -1.0 {
                return Err(ConfigError::InvalidTransform(format!(
                    "RandAffine: scale range {:?} would flip or collapse the image",
                    scale_range[i]
                )));
            }
        }
        Ok(Self {
            keys,
            prob,
            rotate,
            shear,
            scale,
        })
    }

    /// 采样一个仿射矩阵.
    fn sample_matrix(&self, rng: &mut dyn RngCore) -> Mat3 {
        let angles = self.rotate.map(|r| sample(rng, r));
        let [s0, s1, s2] = self.shear.map(|r| sample(rng, r));
        let [kz, ky, kx] = self.scale.map(|r| 1.0 + sample(rng, r));

        let r = matmul(
            &matmul(&rotation(1, 2, angles[0]), &rotation(0, 2, angles[1])),
            &rotation(0, 1, angles[2]),
        );
        let sh = [[1.0, s0, s1], [0.0, 1.0, s2], [0.0, 0.0, 1.0]];
        let s = [[kz, 0.0, 0.0], [0.0, ky, 0.0], [0.0, 0.0, kx]];
        matmul(&matmul(&r, &sh), &s)
    }
}

/// 把坐标反射到 `[-0.5, n - 0.5]` 内, 再截断到 `[0, n - 1]`.
fn reflect(x: f32, n: usize) -> f32 {
    if n <= 1 {
        return 0.0;
    }
    let span = n as f32;
    let mut t = (x + 0.5).rem_euclid(2.0 * span);
    if t > span {
        t = 2.0 * span - t;
    }
    (t - 0.5).clamp(0.0, span - 1.0)
}

fn trilinear(a: &ArrayView3<f32>, p: [f32; 3]) -> f32 {
    let (z, y, x) = a.dim();
    let n = [z, y, x];
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut frac = [0.0f32; 3];
    for k in 0..3 {
        let v = reflect(p[k], n[k]);
        let f = v.floor();
        lo[k] = f as usize;
        hi[k] = (lo[k] + 1).min(n[k] - 1);
        frac[k] = v - f;
    }
    let mut out = 0.0;
    for corner in 0..8 {
        let pick = |k: usize| corner >> (2 - k) & 1 == 1;
        let mut w = 1.0;
        let mut idx = [0usize; 3];
        for k in 0..3 {
            if pick(k) {
                w *= frac[k];
                idx[k] = hi[k];
            } else {
                w *= 1.0 - frac[k];
                idx[k] = lo[k];
            }
        }
        if w > 0.0 {
            out += w * a[idx];
        }
    }
    out
}

/// 以矩阵 `m` 重采样 `(C, Z, Y, X)` 图像.
fn warp(a: &Array4<f32>, m: &Mat3) -> Array4<f32> {
    let (_, z, y, x) = a.dim();
    let center = [z, y, x].map(|n| (n as f32 - 1.0) / 2.0);
    Array4::from_shape_fn(a.raw_dim(), |(c, oz, oy, ox)| {
        let d = [
            oz as f32 - center[0],
            oy as f32 - center[1],
            ox as f32 - center[2],
        ];
        let mut p = center;
        for (i, v) in p.iter_mut().enumerate() {
            *v += m[i][0] * d[0] + m[i][1] * d[1] + m[i][2] * d[2];
        }
        trilinear(&a.index_axis(Axis(0), c), p)
    })
}

impl MapTransform for RandAffine {
    fn name(&self) -> &'static str {
        "RandAffine"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        if rng.random::<f32>() >= self.prob {
            return Ok(Crops::Single(images));
        }
        let m = self.sample_matrix(rng);
        for k in self.keys.iter() {
            let a = images.require_mut(k)?;
            *a = warp(a, &m);
        }
        Ok(Crops::Single(images))
    }

    fn z_scale_range(&self) -> Option<(f32, f32)> {
        Some(self.scale[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn ramp() -> Array4<f32> {
        Array4::from_shape_fn((1, 4, 6, 6), |(_, z, y, x)| (z * 100 + y * 10 + x) as f32)
    }

    fn zero3() -> [AxisRange; 3] {
        [AxisRange::default(); 3]
    }

    #[test]
    fn test_axis_range_json() {
        let r: [AxisRange; 3] = serde_json::from_str("[0.1, [-0.2, 0.3], 0]").unwrap();
        assert_eq!(r[0].bounds(), (-0.1, 0.1));
        assert_eq!(r[1].bounds(), (-0.2, 0.3));
        assert_eq!(r[2].bounds(), (0.0, 0.0));
    }

    #[test]
    fn test_identity_matrix_keeps_image() {
        let t = RandAffine::new(vec!["Phase3D".into()], 1.0, zero3(), zero3(), zero3()).unwrap();
        let mut im = ChannelImages::new(None);
        im.insert("Phase3D", ramp());
        let mut rng = StdRng::seed_from_u64(0);
        let out = t.apply(im, &mut rng).unwrap().into_vec();
        let p = out[0].get("Phase3D").unwrap();
        assert!(p.iter().zip(ramp().iter()).all(|(&a, &b)| float_eq(a, b)));
    }

    #[test]
    fn test_rotate_half_turn_in_yx() {
        // 绕 Z 轴旋转 pi: (y, x) -> (5 - y, 5 - x).
        let pi = std::f32::consts::PI;
        let rotate = [
            AxisRange::Range(pi, pi),
            AxisRange::default(),
            AxisRange::default(),
        ];
        let t = RandAffine::new(vec!["Phase3D".into()], 1.0, rotate, zero3(), zero3()).unwrap();
        let m = t.sample_matrix(&mut StdRng::seed_from_u64(0));
        let out = warp(&ramp(), &m);
        assert!(float_eq(out[(0, 2, 0, 0)], 255.0));
        assert!(float_eq(out[(0, 1, 1, 4)], 141.0));
    }

    #[test]
    fn test_z_zoom_out_samples_wider_range() {
        // z 倍率 2: 输出中心附近的切片来自更远的输入切片.
        let scale = [
            AxisRange::Range(1.0, 1.0),
            AxisRange::default(),
            AxisRange::default(),
        ];
        let t = RandAffine::new(vec!["Phase3D".into()], 1.0, zero3(), zero3(), scale).unwrap();
        assert_eq!(t.z_scale_range(), Some((1.0, 1.0)));
        let m = t.sample_matrix(&mut StdRng::seed_from_u64(0));
        let out = warp(&ramp(), &m);
        // 中心 1.5; 输出 z = 2 -> 输入 z = 2.5.
        assert!(float_eq(out[(0, 2, 0, 0)], 250.0));
        // 输出 z = 3 -> 输入 z = 4.5, 反射后为 2.5.
        assert!(float_eq(out[(0, 3, 0, 0)], 250.0));
    }

    #[test]
    fn test_reflect() {
        assert!(float_eq(reflect(-1.0, 4), 0.0));
        assert!(float_eq(reflect(4.0, 4), 3.0));
        assert!(float_eq(reflect(5.0, 4), 2.0));
        assert!(float_eq(reflect(-3.0, 4), 2.0));
        assert!(float_eq(reflect(7.0, 1), 0.0));
    }

    #[test]
    fn test_invalid_ranges() {
        let bad = [AxisRange::Range(0.2, 0.1), AxisRange::default(), AxisRange::default()];
        assert!(RandAffine::new(vec![], 0.5, bad, zero3(), zero3()).is_err());
        let flip = [AxisRange::Symmetric(1.0), AxisRange::default(), AxisRange::default()];
        assert!(RandAffine::new(vec![], 0.5, zero3(), zero3(), flip).is_err());
        assert!(RandAffine::new(vec![], 2.0, zero3(), zero3(), zero3()).is_err());
    }
}
