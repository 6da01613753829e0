//! Per-view pose estimation: initialisation from a homography decomposition
//! and Gauss-Newton refinement against the fisheye projection.

use fisheye_core::{rodrigues, rotation_to_rodrigues, Pose};
use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};

use crate::distortion::undistort_points;
use crate::homography::compute_homography;
use crate::params::IntrinsicParams;
use crate::project::project_points_with_jacobian;
use crate::{CalibError, Result};

/// Map pixels to undistorted normalized camera coordinates through the
/// current intrinsics (skew compensated, identity rectification).
pub(crate) fn normalize_pixels(
    image_points: &[Vector2<f64>],
    params: &IntrinsicParams,
) -> Vec<Vector2<f64>> {
    undistort_points(
        image_points,
        &params.intrinsics(),
        &params.distortion(),
        None,
        None,
    )
}

/// Initial pose of one calibration view.
///
/// The object cloud is re-expressed in its principal frame (covariance SVD,
/// determinant-corrected, reset to identity when the plane normal is
/// degenerate), a homography is fitted from the re-centred planar points to
/// the normalized image points, and the pose is read off its orthonormalised
/// columns.
pub fn init_extrinsics(
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    params: &IntrinsicParams,
) -> Result<Pose> {
    if object_points.len() != image_points.len() {
        return Err(CalibError::InvalidInput(
            "init_extrinsics: object/image point counts differ".to_string(),
        ));
    }
    if object_points.is_empty() {
        return Err(CalibError::InvalidInput(
            "init_extrinsics: empty point set".to_string(),
        ));
    }

    let normalized = normalize_pixels(image_points, params);

    let np = object_points.len() as f64;
    let mean = object_points.iter().sum::<Vector3<f64>>() / np;
    let mut cov = Matrix3::<f64>::zeros();
    for p in object_points {
        let d = p - mean;
        cov += d * d.transpose();
    }

    let svd = cov.svd(true, true);
    let mut r: Matrix3<f64> = svd.v_t.ok_or_else(|| {
        CalibError::DegenerateSystem("init_extrinsics: covariance SVD failed".to_string())
    })?;
    // Near-planar target with a degenerate third axis.
    if (r[(0, 2)] * r[(0, 2)] + r[(1, 2)] * r[(1, 2)]).sqrt() < 1e-6 {
        r = Matrix3::identity();
    }
    if r.determinant() < 0.0 {
        r = -r;
    }
    let t = -r * mean;

    let recentred: Vec<Vector2<f64>> = object_points
        .iter()
        .map(|p| {
            let q = r * p + t;
            Vector2::new(q.x, q.y)
        })
        .collect();

    let mut h = compute_homography(&normalized, &recentred)?;
    let sc = 0.5 * (h.column(0).norm() + h.column(1).norm());
    if sc <= f64::EPSILON {
        return Err(CalibError::DegenerateSystem(
            "init_extrinsics: vanishing homography scale".to_string(),
        ));
    }
    h /= sc;

    let u1 = h.column(0) / h.column(0).norm();
    let mut u2 = h.column(1) - u1 * u1.dot(&h.column(1));
    u2 /= u2.norm();
    let u3 = u1.cross(&u2);
    let rot = Matrix3::from_columns(&[u1, u2, u3]);

    let omckk = rotation_to_rodrigues(&rot);
    let rckk = rodrigues(&omckk);
    let tckk = Vector3::new(h[(0, 2)], h[(1, 2)], h[(2, 2)]) + rckk * t;
    let omckk = rotation_to_rodrigues(&(rckk * r));

    Ok(Pose::new(omckk, tckk))
}

/// Gauss-Newton refinement of one view pose. Stops when the relative step
/// drops below `1e-10` or after `max_iter` iterations, and aborts early —
/// keeping the current estimate — when the pose Jacobian's condition number
/// exceeds `thresh_cond`.
///
/// Also returns the last 2Nx6 pose Jacobian so callers can re-check its
/// conditioning.
pub fn refine_extrinsics(
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    initial: &Pose,
    params: &IntrinsicParams,
    max_iter: usize,
    thresh_cond: f64,
) -> Result<(Pose, DMatrix<f64>)> {
    if object_points.len() != image_points.len() || object_points.is_empty() {
        return Err(CalibError::InvalidInput(
            "refine_extrinsics: inconsistent point sets".to_string(),
        ));
    }

    let n = object_points.len();
    let intr = params.intrinsics();
    let dist = params.distortion();

    let mut pose = *initial;
    let mut jext = DMatrix::<f64>::zeros(2 * n, 6);
    let mut change = 1.0f64;
    let mut iter = 0usize;

    while change > 1e-10 && iter < max_iter {
        let (projected, jac) = project_points_with_jacobian(object_points, &pose, &intr, &dist);

        let mut ex = DVector::<f64>::zeros(2 * n);
        for i in 0..n {
            ex[2 * i] = image_points[i].x - projected[i].x;
            ex[2 * i + 1] = image_points[i].y - projected[i].y;
        }

        jext = jac.columns(8, 6).into_owned();

        let sv = jext.clone().svd(false, false).singular_values;
        let cond = sv[0] / sv[sv.len() - 1];
        if cond > thresh_cond {
            change = 0.0;
            continue;
        }

        let jtj = jext.transpose() * &jext;
        let jte = jext.transpose() * &ex;
        let innov = jtj
            .svd(true, true)
            .solve(&jte, f64::EPSILON)
            .map_err(|e| CalibError::DegenerateSystem(e.to_string()))?;

        let mut packed = [
            pose.rvec.x,
            pose.rvec.y,
            pose.rvec.z,
            pose.tvec.x,
            pose.tvec.y,
            pose.tvec.z,
        ];
        for (p, d) in packed.iter_mut().zip(innov.iter()) {
            *p += d;
        }
        let updated_norm = packed.iter().map(|v| v * v).sum::<f64>().sqrt();
        change = innov.norm() / updated_norm;

        pose = Pose::new(
            Vector3::new(packed[0], packed[1], packed[2]),
            Vector3::new(packed[3], packed[4], packed[5]),
        );
        iter += 1;
    }

    Ok((pose, jext))
}

/// Initialise and refine the pose of every calibration view. With
/// `check_cond` set, an ill-conditioned pose Jacobian in any view fails the
/// whole run.
pub fn calibrate_extrinsics(
    object_points: &[Vec<Vector3<f64>>],
    image_points: &[Vec<Vector2<f64>>],
    params: &IntrinsicParams,
    check_cond: bool,
    thresh_cond: f64,
) -> Result<Vec<Pose>> {
    if object_points.len() != image_points.len() {
        return Err(CalibError::InvalidInput(
            "calibrate_extrinsics: view counts differ".to_string(),
        ));
    }

    let max_iter = 20;
    let mut poses = Vec::with_capacity(object_points.len());
    for (view_idx, (object, image)) in object_points.iter().zip(image_points.iter()).enumerate() {
        let initial = init_extrinsics(object, image, params)?;
        let (pose, jext) = refine_extrinsics(object, image, &initial, params, max_iter, thresh_cond)?;

        if check_cond {
            let sv = jext.svd(false, false).singular_values;
            let cond = sv[0] / sv[sv.len() - 1];
            if cond > thresh_cond {
                return Err(CalibError::IllConditioned(format!(
                    "view {view_idx}: pose Jacobian condition number {cond:.3e} exceeds {thresh_cond:.1e}"
                )));
            }
        }
        poses.push(pose);
    }
    Ok(poses)
}
