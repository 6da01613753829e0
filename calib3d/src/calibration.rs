//! Single-camera fisheye calibration: damped Gauss-Newton over the joint
//! intrinsic + per-view extrinsic parameter vector, with the block-arrowhead
//! normal equations assembled view by view.

use fisheye_core::Pose;
use nalgebra::{DMatrix, DVector, Vector2, Vector3, Vector4};

use crate::extrinsics::calibrate_extrinsics;
use crate::params::IntrinsicParams;
use crate::project::{project_points, project_points_with_jacobian};
use crate::{CalibError, Result};

/// Condition-number ceiling for the per-view pose Jacobians.
pub(crate) const THRESH_COND: f64 = 1e6;

// Base step fraction of the damped update; the effective factor is
// 1 - (1 - ALPHA_SMOOTH)^(iter + 1), increasing towards 1.
const ALPHA_SMOOTH: f64 = 0.4;

/// Which parts of the intrinsic block are estimated and how the loop treats
/// the extrinsics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationFlags {
    /// Start from the supplied intrinsics instead of the image-size seed.
    pub use_intrinsic_guess: bool,
    pub fix_skew: bool,
    pub fix_k1: bool,
    pub fix_k2: bool,
    pub fix_k3: bool,
    pub fix_k4: bool,
    /// Re-run the per-view pose solver after every damped step.
    pub recompute_extrinsic: bool,
    /// Fail the run when any pose Jacobian is ill-conditioned.
    pub check_cond: bool,
}

/// Outer-loop termination: maximum iteration count, relative-change epsilon,
/// or whichever of the two triggers first.
#[derive(Debug, Clone, Copy)]
pub enum TermCriteria {
    Count(usize),
    Eps(f64),
    Both { max_count: usize, epsilon: f64 },
}

impl TermCriteria {
    pub(crate) fn should_stop(&self, iter: usize, change: f64) -> bool {
        match *self {
            TermCriteria::Count(max_count) => iter >= max_count,
            TermCriteria::Eps(epsilon) => change <= epsilon,
            TermCriteria::Both { max_count, epsilon } => change <= epsilon || iter >= max_count,
        }
    }
}

impl Default for TermCriteria {
    fn default() -> Self {
        TermCriteria::Both {
            max_count: 100,
            epsilon: f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub params: IntrinsicParams,
    pub poses: Vec<Pose>,
    /// Root-mean-square reprojection error over all points.
    pub rms: f64,
    /// Three-sigma standard errors of the estimated intrinsics, stored in an
    /// [`IntrinsicParams`] with the same estimate mask (unestimated slots are
    /// zero).
    pub errors: IntrinsicParams,
    /// Per-channel standard deviation of the residuals.
    pub err_std: Vector2<f64>,
}

/// Calibrate one fisheye camera from planar (or general) calibration views.
///
/// Without an intrinsic guess the state is seeded from the image size.
/// Per-view poses come from the homography-based solver, and the outer loop
/// applies damped Gauss-Newton steps to the intrinsics and every pose until
/// `criteria` is met. The reported uncertainties follow the residual spread
/// at the solution.
pub fn calibrate(
    object_points: &[Vec<Vector3<f64>>],
    image_points: &[Vec<Vector2<f64>>],
    image_size: (u32, u32),
    initial: Option<&IntrinsicParams>,
    flags: CalibrationFlags,
    criteria: TermCriteria,
) -> Result<CalibrationReport> {
    validate_views(object_points, image_points)?;

    let mut final_param = match (flags.use_intrinsic_guess, initial) {
        (true, Some(guess)) => IntrinsicParams::new(
            guess.f,
            guess.c,
            Vector4::new(
                if flags.fix_k1 { 0.0 } else { guess.k[0] },
                if flags.fix_k2 { 0.0 } else { guess.k[1] },
                if flags.fix_k3 { 0.0 } else { guess.k[2] },
                if flags.fix_k4 { 0.0 } else { guess.k[3] },
            ),
            guess.alpha,
        ),
        (true, None) => {
            return Err(CalibError::InvalidInput(
                "calibrate: use_intrinsic_guess set but no initial intrinsics supplied".to_string(),
            ))
        }
        (false, _) => IntrinsicParams::from_image_size(image_size),
    };
    final_param.is_estimate = [
        true,
        true,
        true,
        true,
        !flags.fix_skew,
        !flags.fix_k1,
        !flags.fix_k2,
        !flags.fix_k3,
        !flags.fix_k4,
    ];

    let mut poses = calibrate_extrinsics(
        object_points,
        image_points,
        &final_param,
        flags.check_cond,
        THRESH_COND,
    )?;

    let mut change = 1.0f64;
    let mut iter = 0usize;
    loop {
        if criteria.should_stop(iter, change) {
            break;
        }

        let alpha_smooth2 = 1.0 - (1.0 - ALPHA_SMOOTH).powi(iter as i32 + 1);

        let (jj2_inv, ex3) = compute_jacobians(
            object_points,
            image_points,
            &final_param,
            &poses,
            flags.check_cond,
            THRESH_COND,
        )?;

        let g = jj2_inv * ex3 * alpha_smooth2;
        let nest = final_param.num_estimated();

        let current = final_param.updated(g.as_slice());
        let new_fc = Vector4::new(current.f.x, current.f.y, current.c.x, current.c.y);
        let old_fc = Vector4::new(
            final_param.f.x,
            final_param.f.y,
            final_param.c.x,
            final_param.c.y,
        );
        change = (new_fc - old_fc).norm() / new_fc.norm();
        final_param = current;

        for (k, pose) in poses.iter_mut().enumerate() {
            let off = nest + 6 * k;
            pose.rvec += Vector3::new(g[off], g[off + 1], g[off + 2]);
            pose.tvec += Vector3::new(g[off + 3], g[off + 4], g[off + 5]);
        }

        if flags.recompute_extrinsic {
            poses = calibrate_extrinsics(
                object_points,
                image_points,
                &final_param,
                flags.check_cond,
                THRESH_COND,
            )?;
        }

        iter += 1;
    }

    let (rms, errors, err_std) = estimate_uncertainties(
        object_points,
        image_points,
        &final_param,
        &poses,
        flags.check_cond,
        THRESH_COND,
    )?;

    Ok(CalibrationReport {
        params: final_param,
        poses,
        rms,
        errors,
        err_std,
    })
}

fn validate_views(
    object_points: &[Vec<Vector3<f64>>],
    image_points: &[Vec<Vector2<f64>>],
) -> Result<()> {
    if object_points.is_empty() || object_points.len() != image_points.len() {
        return Err(CalibError::InvalidInput(
            "calibrate: need a non-empty, equal number of object and image point sets".to_string(),
        ));
    }
    for (k, (obj, img)) in object_points.iter().zip(image_points.iter()).enumerate() {
        if obj.len() != img.len() {
            return Err(CalibError::InvalidInput(format!(
                "calibrate: view {k} has {} object but {} image points",
                obj.len(),
                img.len()
            )));
        }
        if obj.len() < 4 {
            return Err(CalibError::InvalidInput(format!(
                "calibrate: view {k} needs at least 4 correspondences"
            )));
        }
    }
    Ok(())
}

// Assemble the (9 + 6n)^2 block-arrowhead normal matrix and residual vector,
// reduce both by the estimate mask, and invert the reduced matrix. The
// returned pair solves one Gauss-Newton step as `delta = JJ^-1 * ex`.
fn compute_jacobians(
    object_points: &[Vec<Vector3<f64>>],
    image_points: &[Vec<Vector2<f64>>],
    params: &IntrinsicParams,
    poses: &[Pose],
    check_cond: bool,
    thresh_cond: f64,
) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let n = poses.len();
    let nparams = 9 + 6 * n;
    let intr = params.intrinsics();
    let dist = params.distortion();

    let mut jj3 = DMatrix::<f64>::zeros(nparams, nparams);
    let mut ex3 = DVector::<f64>::zeros(nparams);

    for (view_idx, ((object, image), pose)) in object_points
        .iter()
        .zip(image_points.iter())
        .zip(poses.iter())
        .enumerate()
    {
        let (projected, jac) = project_points_with_jacobian(object, pose, &intr, &dist);
        let p = object.len();

        // Intrinsic columns reordered to (fx, fy, cx, cy, alpha, k1..k4);
        // extrinsic columns stay (rvec, tvec).
        let mut a = DMatrix::<f64>::zeros(2 * p, 9);
        a.column_mut(0).copy_from(&jac.column(0));
        a.column_mut(1).copy_from(&jac.column(1));
        a.column_mut(2).copy_from(&jac.column(2));
        a.column_mut(3).copy_from(&jac.column(3));
        a.column_mut(4).copy_from(&jac.column(14));
        for j in 0..4 {
            a.column_mut(5 + j).copy_from(&jac.column(4 + j));
        }
        let b = jac.columns(8, 6).into_owned();

        let mut exkk = DVector::<f64>::zeros(2 * p);
        for i in 0..p {
            exkk[2 * i] = image[i].x - projected[i].x;
            exkk[2 * i + 1] = image[i].y - projected[i].y;
        }

        let ata = a.transpose() * &a;
        let btb = b.transpose() * &b;
        let atb = a.transpose() * &b;

        let off = 9 + 6 * view_idx;
        for i in 0..9 {
            for j in 0..9 {
                jj3[(i, j)] += ata[(i, j)];
            }
        }
        for i in 0..6 {
            for j in 0..6 {
                jj3[(off + i, off + j)] = btb[(i, j)];
            }
        }
        for i in 0..9 {
            for j in 0..6 {
                jj3[(i, off + j)] = atb[(i, j)];
                jj3[(off + j, i)] = atb[(i, j)];
            }
        }

        let ae = a.transpose() * &exkk;
        let be = b.transpose() * &exkk;
        for i in 0..9 {
            ex3[i] += ae[i];
        }
        for i in 0..6 {
            ex3[off + i] = be[i];
        }

        if check_cond {
            let sv = b.svd(false, false).singular_values;
            let cond = sv[0] / sv[sv.len() - 1];
            if cond > thresh_cond {
                return Err(CalibError::IllConditioned(format!(
                    "view {view_idx}: pose Jacobian condition number {cond:.3e} exceeds {thresh_cond:.1e}"
                )));
            }
        }
    }

    let mut selected = vec![true; nparams];
    selected[..9].copy_from_slice(&params.is_estimate);

    let jj3 = sub_matrix(&jj3, &selected, &selected);
    let ex3 = sub_vector(&ex3, &selected);
    let jj2_inv = jj3.try_inverse().ok_or_else(|| {
        CalibError::DegenerateSystem("calibrate: singular normal equations".to_string())
    })?;

    Ok((jj2_inv, ex3))
}

// Residual-based RMS and three-sigma parameter standard errors, computed
// from scratch at the converged state.
fn estimate_uncertainties(
    object_points: &[Vec<Vector3<f64>>],
    image_points: &[Vec<Vector2<f64>>],
    params: &IntrinsicParams,
    poses: &[Pose],
    check_cond: bool,
    thresh_cond: f64,
) -> Result<(f64, IntrinsicParams, Vector2<f64>)> {
    let intr = params.intrinsics();
    let dist = params.distortion();

    let mut residuals: Vec<Vector2<f64>> = Vec::new();
    for ((object, image), pose) in object_points
        .iter()
        .zip(image_points.iter())
        .zip(poses.iter())
    {
        let projected = project_points(object, pose, &intr, &dist);
        for (img, proj) in image.iter().zip(projected.iter()) {
            residuals.push(img - proj);
        }
    }

    let total = residuals.len() as f64;
    let mean = residuals.iter().sum::<Vector2<f64>>() / total;
    let mut var = Vector2::<f64>::zeros();
    for r in &residuals {
        let d = r - mean;
        var += d.component_mul(&d);
    }
    let mut err_std = Vector2::new((var.x / total).sqrt(), (var.y / total).sqrt());
    err_std *= (total / (total - 1.0)).sqrt();

    // Scalar residual deviation with the small-sample factor sqrt(2N/(2N-1)).
    let count2 = 2.0 * total;
    let mean_s = residuals.iter().map(|r| r.x + r.y).sum::<f64>() / count2;
    let var_s = residuals
        .iter()
        .map(|r| (r.x - mean_s).powi(2) + (r.y - mean_s).powi(2))
        .sum::<f64>()
        / count2;
    let sigma_x = var_s.sqrt() * (count2 / (count2 - 1.0)).sqrt();

    let (jj2_inv, _) = compute_jacobians(
        object_points,
        image_points,
        params,
        poses,
        check_cond,
        thresh_cond,
    )?;

    let mut errors = IntrinsicParams {
        is_estimate: params.is_estimate,
        ..Default::default()
    };
    let error_values: Vec<f64> = (0..jj2_inv.nrows())
        .map(|i| 3.0 * sigma_x * jj2_inv[(i, i)].sqrt())
        .collect();
    errors.assign(&error_values);

    let rms = (residuals.iter().map(|r| r.norm_squared()).sum::<f64>() / total).sqrt();

    Ok((rms, errors, err_std))
}

pub(crate) fn sub_matrix(m: &DMatrix<f64>, rows: &[bool], cols: &[bool]) -> DMatrix<f64> {
    let row_idx: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, &on)| on.then_some(i))
        .collect();
    let col_idx: Vec<usize> = cols
        .iter()
        .enumerate()
        .filter_map(|(i, &on)| on.then_some(i))
        .collect();

    let mut out = DMatrix::zeros(row_idx.len(), col_idx.len());
    for (i, &ri) in row_idx.iter().enumerate() {
        for (j, &cj) in col_idx.iter().enumerate() {
            out[(i, j)] = m[(ri, cj)];
        }
    }
    out
}

pub(crate) fn sub_vector(v: &DVector<f64>, rows: &[bool]) -> DVector<f64> {
    let values: Vec<f64> = v
        .iter()
        .zip(rows.iter())
        .filter_map(|(&x, &on)| on.then_some(x))
        .collect();
    DVector::from_vec(values)
}
