// Element kinds a tensor can carry. Storage is always f32; reduced precision
// kinds keep their values rounded to the representable set.

use half::bf16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    F32,
    BF16,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::BF16 => "bf16",
        }
    }

    /// Round a single value to this dtype's precision.
    #[inline]
    pub fn round(&self, v: f32) -> f32 {
        match self {
            Self::F32 => v,
            Self::BF16 => bf16::from_f32(v).to_f32(),
        }
    }

    /// Round a buffer in place. No-op for F32.
    pub fn round_slice(&self, data: &mut [f32]) {
        if *self == Self::F32 {
            return;
        }
        for v in data.iter_mut() {
            *v = self.round(*v);
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
