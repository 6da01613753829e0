//! Rodrigues rotation-vector conversions with analytic Jacobians.
//!
//! Rotation matrices are flattened row-major throughout: the Jacobian of a
//! matrix-valued function stacks `dR(i, j)` at flat index `3*i + j`. The
//! vector-to-matrix Jacobian is 9x3, the matrix-to-vector Jacobian 3x9, and
//! matrix-product derivatives are 9x9, so chain-rule products compose without
//! any reindexing.

use nalgebra::{Matrix3, SMatrix, Vector3};

pub type Matrix9x3 = SMatrix<f64, 9, 3>;
pub type Matrix3x9 = SMatrix<f64, 3, 9>;
pub type Matrix9 = SMatrix<f64, 9, 9>;

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix from a Rodrigues vector (matrix exponential of `[rvec]x`).
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    let theta = rvec.norm();
    if theta < f64::EPSILON {
        return Matrix3::identity() + skew(rvec);
    }
    let u = rvec / theta;
    let c = theta.cos();
    let s = theta.sin();
    Matrix3::identity() * c + (u * u.transpose()) * (1.0 - c) + skew(&u) * s
}

/// Rotation matrix together with the 9x3 Jacobian `d vec(R) / d rvec`.
pub fn rodrigues_with_jacobian(rvec: &Vector3<f64>) -> (Matrix3<f64>, Matrix9x3) {
    let theta = rvec.norm();
    let mut jac = Matrix9x3::zeros();

    if theta < f64::EPSILON {
        // At the identity dR/d(rvec_k) is the k-th skew basis matrix.
        for k in 0..3 {
            let mut e = Vector3::zeros();
            e[k] = 1.0;
            let d = skew(&e);
            for i in 0..3 {
                for j in 0..3 {
                    jac[(3 * i + j, k)] = d[(i, j)];
                }
            }
        }
        return (Matrix3::identity() + skew(rvec), jac);
    }

    let u = rvec / theta;
    let c = theta.cos();
    let s = theta.sin();
    let c1 = 1.0 - c;
    let itheta = 1.0 / theta;

    let uut = u * u.transpose();
    let ux = skew(&u);
    let r = Matrix3::identity() * c + uut * c1 + ux * s;

    for k in 0..3 {
        let uk = u[k];
        let a0 = -s * uk;
        let a1 = (s - 2.0 * c1 * itheta) * uk;
        let a2 = c1 * itheta;
        let a3 = (c - s * itheta) * uk;
        let a4 = s * itheta;

        let mut e = Vector3::zeros();
        e[k] = 1.0;
        let duut = e * u.transpose() + u * e.transpose();
        let dux = skew(&e);

        let d = Matrix3::identity() * a0 + uut * a1 + duut * a2 + ux * a3 + dux * a4;
        for i in 0..3 {
            for j in 0..3 {
                jac[(3 * i + j, k)] = d[(i, j)];
            }
        }
    }

    (r, jac)
}

/// Rodrigues vector from a rotation matrix, with `theta` normalised to
/// `[0, pi]`.
pub fn rotation_to_rodrigues(r: &Matrix3<f64>) -> Vector3<f64> {
    rotation_to_rodrigues_with_jacobian(r).0
}

/// Rodrigues vector together with the 3x9 Jacobian `d rvec / d vec(R)`.
///
/// For rotations with `theta` close to `pi` the axis is recovered from the
/// diagonal of `R` and the Jacobian is left at zero: the inverse map is not
/// differentiable there.
pub fn rotation_to_rodrigues_with_jacobian(r: &Matrix3<f64>) -> (Vector3<f64>, Matrix3x9) {
    let om1 = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    );
    let s = (om1.dot(&om1) * 0.25).sqrt();
    let c = ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = c.acos();

    let mut jac = Matrix3x9::zeros();

    if s < 1e-5 {
        if c > 0.0 {
            // Near the identity: rvec = om1 / 2.
            let d = half_difference_jacobian();
            return (om1 * 0.5, d);
        }
        // theta ~ pi: axis from the diagonal, sign from the off-diagonals.
        let rx = ((r[(0, 0)] + 1.0) * 0.5).max(0.0).sqrt();
        let mut ry = ((r[(1, 1)] + 1.0) * 0.5).max(0.0).sqrt();
        let mut rz = ((r[(2, 2)] + 1.0) * 0.5).max(0.0).sqrt();
        if r[(0, 1)] < 0.0 {
            ry = -ry;
        }
        if r[(0, 2)] < 0.0 {
            rz = -rz;
        }
        if rx.abs() < ry.abs() && rx.abs() < rz.abs() && (r[(1, 2)] > 0.0) != (ry * rz > 0.0) {
            rz = -rz;
        }
        let axis = Vector3::new(rx, ry, rz);
        let n = axis.norm();
        if n < f64::EPSILON {
            return (Vector3::zeros(), jac);
        }
        return (axis * (theta / n), jac);
    }

    // omega = unit(om1) * theta, with theta taken from the trace and the
    // axis from the skew part. Differentiate exactly that: the axis varies
    // through the normalised differences, the angle through the diagonal.
    let norm = om1.norm();
    let u = om1 / norm;
    let omega = u * theta;

    let dtheta_ddiag = -0.5 / s;
    let d_om1 = difference_jacobian();
    for j in 0..9 {
        let dom1_j = Vector3::new(d_om1[(0, j)], d_om1[(1, j)], d_om1[(2, j)]);
        let du_j = (dom1_j - u * u.dot(&dom1_j)) / norm;
        let dtheta_j = if j == 0 || j == 4 || j == 8 {
            dtheta_ddiag
        } else {
            0.0
        };
        let col = du_j * theta + u * dtheta_j;
        for i in 0..3 {
            jac[(i, j)] = col[i];
        }
    }

    (omega, jac)
}

// d(om1)/d vec(R) for om1 = (R21 - R12, R02 - R20, R10 - R01).
fn difference_jacobian() -> Matrix3x9 {
    let mut d = Matrix3x9::zeros();
    d[(0, 7)] = 1.0;
    d[(0, 5)] = -1.0;
    d[(1, 2)] = 1.0;
    d[(1, 6)] = -1.0;
    d[(2, 3)] = 1.0;
    d[(2, 1)] = -1.0;
    d
}

fn half_difference_jacobian() -> Matrix3x9 {
    difference_jacobian() * 0.5
}

/// Derivatives of the matrix product `C = A * B` with respect to each factor,
/// both 9x9 in the row-major flattening.
pub fn matmul_jacobians(a: &Matrix3<f64>, b: &Matrix3<f64>) -> (Matrix9, Matrix9) {
    let mut dc_da = Matrix9::zeros();
    let mut dc_db = Matrix9::zeros();
    for i in 0..3 {
        for j in 0..3 {
            let ci = 3 * i + j;
            for k in 0..3 {
                dc_da[(ci, 3 * i + k)] = b[(k, j)];
                dc_db[(ci, 3 * k + j)] = a[(i, k)];
            }
        }
    }
    (dc_da, dc_db)
}

/// Partial derivatives of the composed motion returned by [`compose_motion`].
/// Blocks that vanish identically (`d om3 / d T*`, `d T3 / d om1`) are kept so
/// callers can chain-rule without special cases.
#[derive(Debug, Clone, Copy)]
pub struct MotionDerivatives {
    pub dom3_dom1: Matrix3<f64>,
    pub dom3_dt1: Matrix3<f64>,
    pub dom3_dom2: Matrix3<f64>,
    pub dom3_dt2: Matrix3<f64>,
    pub dt3_dom1: Matrix3<f64>,
    pub dt3_dt1: Matrix3<f64>,
    pub dt3_dom2: Matrix3<f64>,
    pub dt3_dt2: Matrix3<f64>,
}

/// Compose two rigid motions: `(om3, T3)` maps a point through `(om1, T1)`
/// then `(om2, T2)`, so `R3 = R2 * R1` and `T3 = R2 * T1 + T2`.
pub fn compose_motion(
    om1: &Vector3<f64>,
    t1: &Vector3<f64>,
    om2: &Vector3<f64>,
    t2: &Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>, MotionDerivatives) {
    let (r1, dr1_dom1) = rodrigues_with_jacobian(om1);
    let (r2, dr2_dom2) = rodrigues_with_jacobian(om2);

    let r3 = r2 * r1;
    let (dr3_dr2, dr3_dr1) = matmul_jacobians(&r2, &r1);
    let (om3, dom3_dr3) = rotation_to_rodrigues_with_jacobian(&r3);

    let dom3_dom1 = dom3_dr3 * dr3_dr1 * dr1_dom1;
    let dom3_dom2 = dom3_dr3 * dr3_dr2 * dr2_dom2;

    let t3 = r2 * t1 + t2;
    // d(R2 * T1)/d vec(R2): row i carries T1^T in columns 3i..3i+3.
    let mut dt3_dr2 = Matrix3x9::zeros();
    for i in 0..3 {
        for k in 0..3 {
            dt3_dr2[(i, 3 * i + k)] = t1[k];
        }
    }
    let dt3_dom2 = dt3_dr2 * dr2_dom2;

    let derivatives = MotionDerivatives {
        dom3_dom1,
        dom3_dt1: Matrix3::zeros(),
        dom3_dom2,
        dom3_dt2: Matrix3::zeros(),
        dt3_dom1: Matrix3::zeros(),
        dt3_dt1: r2,
        dt3_dom2,
        dt3_dt2: Matrix3::identity(),
    };

    (om3, t3, derivatives)
}
