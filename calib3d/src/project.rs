//! Forward fisheye projection with optional analytic Jacobian.
//!
//! This is the computational kernel every calibration loop calls: the
//! equidistant projection of 3-D points through `(rvec, tvec)`, the camera
//! matrix and the four-coefficient angle polynomial, plus the exact chain-rule
//! derivatives with respect to every model parameter.

use fisheye_core::{rodrigues_with_jacobian, CameraIntrinsics, FisheyeDistortion, Matrix3x9, Pose};
use nalgebra::{DMatrix, Vector2, Vector3, Vector4};
use rayon::prelude::*;

/// Column count of the per-point Jacobian rows. The layout is fixed:
///
/// | columns | parameters |
/// |---------|------------|
/// | 0..2    | fx, fy     |
/// | 2..4    | cx, cy     |
/// | 4..8    | k1..k4     |
/// | 8..11   | rvec       |
/// | 11..14  | tvec       |
/// | 14      | alpha      |
pub const JACOBIAN_COLS: usize = 15;

/// Project 3-D object points to pixel coordinates through the fisheye model.
///
/// Each point goes through: rigid transform, perspective division,
/// `theta = atan(r)`, the distortion polynomial, the skew term and the camera
/// matrix. Points within `1e-8` of the optical axis keep a unit distortion
/// scale so the output stays finite.
pub fn project_points(
    object_points: &[Vector3<f64>],
    pose: &Pose,
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> Vec<Vector2<f64>> {
    let r = pose.rotation();
    let t = pose.tvec;
    object_points
        .par_iter()
        .map(|xi| project_one(xi, &r, &t, intrinsics, distortion))
        .collect()
}

/// Same projection, additionally filling a `2N x 15` Jacobian (two rows per
/// point, columns as documented on [`JACOBIAN_COLS`]).
///
/// The alpha column is deliberately asymmetric: the y-pixel row is exactly
/// zero and the x-pixel row equals `fx * x1'` (the distorted y-coordinate).
/// Downstream consumers always null the y-row of the alpha column, and the
/// normal equations depend on that convention.
pub fn project_points_with_jacobian(
    object_points: &[Vector3<f64>],
    pose: &Pose,
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> (Vec<Vector2<f64>>, DMatrix<f64>) {
    let n = object_points.len();
    let mut image_points = Vec::with_capacity(n);
    let mut jacobian = DMatrix::zeros(2 * n, JACOBIAN_COLS);

    let (rot, drot_dom) = rodrigues_with_jacobian(&pose.rvec);
    let t = pose.tvec;
    let f = Vector2::new(intrinsics.fx, intrinsics.fy);
    let c = Vector2::new(intrinsics.cx, intrinsics.cy);
    let alpha = intrinsics.alpha;
    let k = distortion.as_vector();

    for (i, xi) in object_points.iter().enumerate() {
        let y = rot * xi + t;
        let x = Vector2::new(y.x / y.z, y.y / y.z);

        let r2 = x.dot(&x);
        let r = r2.sqrt();
        let theta = r.atan();

        let theta2 = theta * theta;
        let theta3 = theta2 * theta;
        let theta4 = theta2 * theta2;
        let theta5 = theta4 * theta;
        let theta6 = theta3 * theta3;
        let theta7 = theta6 * theta;
        let theta8 = theta4 * theta4;
        let theta9 = theta8 * theta;

        let theta_d = theta + k[0] * theta3 + k[1] * theta5 + k[2] * theta7 + k[3] * theta9;

        let inv_r = if r > 1e-8 { 1.0 / r } else { 1.0 };
        let cdist = if r > 1e-8 { theta_d * inv_r } else { 1.0 };

        let xd1 = x * cdist;
        let xd3 = Vector2::new(xd1.x + alpha * xd1.y, xd1.y);
        let pixel = Vector2::new(xd3.x * f.x + c.x, xd3.y * f.y + c.y);
        image_points.push(pixel);

        // dY/d(rvec) through the 9x3 Rodrigues Jacobian.
        let mut dy_dr = Matrix3x9::zeros();
        for row in 0..3 {
            for col in 0..3 {
                dy_dr[(row, 3 * row + col)] = xi[col];
            }
        }
        let dy_dom = dy_dr * drot_dom;

        let mut dx_dom = [Vector3::zeros(), Vector3::zeros()];
        let mut dx_dt = [Vector3::zeros(), Vector3::zeros()];
        for axis in 0..2 {
            dx_dom[axis] =
                (dy_dom.row(axis).transpose() - dy_dom.row(2).transpose() * x[axis]) / y.z;
            let mut dt = Vector3::zeros();
            dt[axis] = 1.0 / y.z;
            dt[2] = -x[axis] / y.z;
            dx_dt[axis] = dt;
        }

        let dr2_dom = dx_dom[0] * (2.0 * x.x) + dx_dom[1] * (2.0 * x.y);
        let dr2_dt = dx_dt[0] * (2.0 * x.x) + dx_dt[1] * (2.0 * x.y);

        let dr_dr2 = if r > 1e-8 { 1.0 / (2.0 * r) } else { 1.0 };
        let dr_dom = dr2_dom * dr_dr2;
        let dr_dt = dr2_dt * dr_dr2;

        let dtheta_dr = 1.0 / (1.0 + r2);
        let dtheta_dom = dr_dom * dtheta_dr;
        let dtheta_dt = dr_dt * dtheta_dr;

        let dthetad_dtheta =
            1.0 + 3.0 * k[0] * theta2 + 5.0 * k[1] * theta4 + 7.0 * k[2] * theta6
                + 9.0 * k[3] * theta8;
        let dthetad_dom = dtheta_dom * dthetad_dtheta;
        let dthetad_dt = dtheta_dt * dthetad_dtheta;
        let dthetad_dk = Vector4::new(theta3, theta5, theta7, theta9);

        let dcdist_dom = (dthetad_dom - dr_dom * cdist) * inv_r;
        let dcdist_dt = (dthetad_dt - dr_dt * cdist) * inv_r;
        let dcdist_dk = dthetad_dk * inv_r;

        let dxd1_dom = [
            dcdist_dom * x.x + dx_dom[0] * cdist,
            dcdist_dom * x.y + dx_dom[1] * cdist,
        ];
        let dxd1_dt = [
            dcdist_dt * x.x + dx_dt[0] * cdist,
            dcdist_dt * x.y + dx_dt[1] * cdist,
        ];
        let dxd1_dk = [dcdist_dk * x.x, dcdist_dk * x.y];

        let dxd3_dom = [dxd1_dom[0] + dxd1_dom[1] * alpha, dxd1_dom[1]];
        let dxd3_dt = [dxd1_dt[0] + dxd1_dt[1] * alpha, dxd1_dt[1]];
        let dxd3_dk = [dxd1_dk[0] + dxd1_dk[1] * alpha, dxd1_dk[1]];

        let row_x = 2 * i;
        let row_y = row_x + 1;

        jacobian[(row_x, 0)] = xd3.x;
        jacobian[(row_y, 1)] = xd3.y;
        jacobian[(row_x, 2)] = 1.0;
        jacobian[(row_y, 3)] = 1.0;
        for j in 0..4 {
            jacobian[(row_x, 4 + j)] = f.x * dxd3_dk[0][j];
            jacobian[(row_y, 4 + j)] = f.y * dxd3_dk[1][j];
        }
        for j in 0..3 {
            jacobian[(row_x, 8 + j)] = f.x * dxd3_dom[0][j];
            jacobian[(row_y, 8 + j)] = f.y * dxd3_dom[1][j];
            jacobian[(row_x, 11 + j)] = f.x * dxd3_dt[0][j];
            jacobian[(row_y, 11 + j)] = f.y * dxd3_dt[1][j];
        }
        jacobian[(row_x, 14)] = f.x * xd1.y;
        jacobian[(row_y, 14)] = 0.0;
    }

    (image_points, jacobian)
}

fn project_one(
    xi: &Vector3<f64>,
    rot: &nalgebra::Matrix3<f64>,
    t: &Vector3<f64>,
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> Vector2<f64> {
    let y = rot * xi + t;
    let x = Vector2::new(y.x / y.z, y.y / y.z);
    let (xd, yd) = distortion.apply(x.x, x.y);
    let xs = xd + intrinsics.alpha * yd;
    Vector2::new(
        xs * intrinsics.fx + intrinsics.cx,
        yd * intrinsics.fy + intrinsics.cy,
    )
}
