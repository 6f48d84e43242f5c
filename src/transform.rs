//! Row-major 4x4 matrix helpers for object-to-world transforms.

pub type Mat4 = [f32; 16];

pub const IDENTITY_MAT4: Mat4 = [
    1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
];

/// Affine transform as the engine takes it: three basis columns then the
/// translation, each a `[x, y, z]` triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine3 {
    pub vx: [f32; 3],
    pub vy: [f32; 3],
    pub vz: [f32; 3],
    pub p: [f32; 3],
}

impl Affine3 {
    pub const IDENTITY: Affine3 = Affine3 {
        vx: [1.0, 0.0, 0.0],
        vy: [0.0, 1.0, 0.0],
        vz: [0.0, 0.0, 1.0],
        p: [0.0, 0.0, 0.0],
    };

    pub fn transform_point(&self, v: [f32; 3]) -> [f32; 3] {
        let mut out = self.p;
        for i in 0..3 {
            out[i] += self.vx[i] * v[0] + self.vy[i] * v[1] + self.vz[i] * v[2];
        }
        out
    }
}

/// Extracts the affine part of a row-major matrix. The last row is ignored.
pub fn affine_from_row_major(m: &Mat4) -> Affine3 {
    Affine3 {
        vx: [m[0], m[4], m[8]],
        vy: [m[1], m[5], m[9]],
        vz: [m[2], m[6], m[10]],
        p: [m[3], m[7], m[11]],
    }
}

pub fn mat4_mul(a: &Mat4, b: &Mat4) -> Mat4 {
    // out[r][c] = sum_k a[r][k] * b[k][c], idx(r, c) = r * 4 + c
    let mut out = [0.0f32; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[r * 4 + c] = a[r * 4] * b[c]
                + a[r * 4 + 1] * b[4 + c]
                + a[r * 4 + 2] * b[8 + c]
                + a[r * 4 + 3] * b[12 + c];
        }
    }
    out
}

pub fn mat4_translate(tx: f32, ty: f32, tz: f32) -> Mat4 {
    [
        1.0, 0.0, 0.0, tx, 0.0, 1.0, 0.0, ty, 0.0, 0.0, 1.0, tz, 0.0, 0.0, 0.0, 1.0,
    ]
}

pub fn mat4_scale(sx: f32, sy: f32, sz: f32) -> Mat4 {
    [
        sx, 0.0, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 0.0, sz, 0.0, 0.0, 0.0, 0.0, 1.0,
    ]
}
