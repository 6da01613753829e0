//! Joint stereo calibration: two intrinsic blocks, per-view poses of the
//! first camera, and a single rigid transform between the cameras, refined
//! together. The right-camera pose of every view is the composition of the
//! view pose with the rig transform, and its Jacobian is chain-ruled through
//! the motion-composition derivatives.

use fisheye_core::{compose_motion, rodrigues, rotation_to_rodrigues, Pose};
use nalgebra::{DMatrix, DVector, Vector2, Vector3, Vector6};

use crate::calibration::{calibrate, sub_matrix, CalibrationFlags, TermCriteria, THRESH_COND};
use crate::extrinsics::calibrate_extrinsics;
use crate::params::IntrinsicParams;
use crate::project::project_points_with_jacobian;
use crate::{CalibError, Result};

// Any single residual above this many pixels marks the pair as unusable.
const BAD_PAIR_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct StereoCalibrationFlags {
    /// Keep both intrinsic blocks fixed at the supplied values and estimate
    /// only the motions.
    pub fix_intrinsic: bool,
    /// Flags forwarded to the per-camera sub-calibrations and intrinsic
    /// masks.
    pub calib: CalibrationFlags,
}

#[derive(Debug, Clone)]
pub struct StereoCalibrationReport {
    pub left: IntrinsicParams,
    pub right: IntrinsicParams,
    /// Rotation (Rodrigues) taking camera-1 coordinates to camera-2.
    pub rvec: Vector3<f64>,
    /// Translation taking camera-1 coordinates to camera-2.
    pub tvec: Vector3<f64>,
    /// Per-view poses of the first camera.
    pub poses: Vec<Pose>,
    pub rms: f64,
}

/// Calibrate a stereo rig from simultaneous views of a shared target.
///
/// Unless `fix_intrinsic` is set, each camera is first calibrated on its own
/// (20 iterations); the rig transform is seeded with the per-coordinate
/// median of the per-view relative motions and the joint system is then
/// refined by Gauss-Newton. A view whose residual exceeds 50 pixels fails
/// the run as a bad stereo pair.
#[allow(clippy::too_many_arguments)]
pub fn stereo_calibrate(
    object_points: &[Vec<Vector3<f64>>],
    image_points1: &[Vec<Vector2<f64>>],
    image_points2: &[Vec<Vector2<f64>>],
    image_size: (u32, u32),
    initial_left: Option<&IntrinsicParams>,
    initial_right: Option<&IntrinsicParams>,
    flags: StereoCalibrationFlags,
    criteria: TermCriteria,
) -> Result<StereoCalibrationReport> {
    validate_stereo_views(object_points, image_points1, image_points2)?;

    let n_images = object_points.len();
    let n_points = object_points[0].len();

    let mut left;
    let mut right;
    let mut poses1;
    let poses2;

    if flags.fix_intrinsic {
        let (Some(l), Some(r)) = (initial_left, initial_right) else {
            return Err(CalibError::InvalidInput(
                "stereo_calibrate: fix_intrinsic requires both intrinsic blocks".to_string(),
            ));
        };
        left = *l;
        right = *r;
        poses1 = calibrate_extrinsics(object_points, image_points1, &left, true, THRESH_COND)?;
        poses2 = calibrate_extrinsics(object_points, image_points2, &right, true, THRESH_COND)?;
    } else {
        let sub_criteria = TermCriteria::Both {
            max_count: 20,
            epsilon: 1e-6,
        };
        let rep1 = calibrate(
            object_points,
            image_points1,
            image_size,
            initial_left,
            flags.calib,
            sub_criteria,
        )?;
        let rep2 = calibrate(
            object_points,
            image_points2,
            image_size,
            initial_right,
            flags.calib,
            sub_criteria,
        )?;
        left = rep1.params;
        right = rep2.params;
        poses1 = rep1.poses;
        poses2 = rep2.poses;
    }

    let est = |fixed: bool| !(fixed || flags.fix_intrinsic);
    let mask = [
        !flags.fix_intrinsic,
        !flags.fix_intrinsic,
        !flags.fix_intrinsic,
        !flags.fix_intrinsic,
        est(flags.calib.fix_skew),
        est(flags.calib.fix_k1),
        est(flags.calib.fix_k2),
        est(flags.calib.fix_k3),
        est(flags.calib.fix_k4),
    ];
    left.is_estimate = mask;
    right.is_estimate = mask;

    // Seed the rig transform with the per-coordinate median over views.
    let mut om_list = Vec::with_capacity(n_images);
    let mut t_list = Vec::with_capacity(n_images);
    for (p1, p2) in poses1.iter().zip(poses2.iter()) {
        let r_ref = rodrigues(&p2.rvec) * rodrigues(&p1.rvec).transpose();
        let t_ref = p2.tvec - r_ref * p1.tvec;
        om_list.push(rotation_to_rodrigues(&r_ref));
        t_list.push(t_ref);
    }
    let mut omcur = median3(&om_list);
    let mut tcur = median3(&t_list);

    let n_rows = 4 * n_points * n_images;
    let n_cols = 18 + 6 * (n_images + 1);
    let mut e = DVector::<f64>::zeros(n_rows);

    let mut selected = vec![true; n_cols];
    selected[..9].copy_from_slice(&left.is_estimate);
    selected[9..18].copy_from_slice(&right.is_estimate);

    let mut change = 1.0f64;
    let mut iter = 0usize;
    loop {
        if criteria.should_stop(iter, change) {
            break;
        }

        let mut jac = DMatrix::<f64>::zeros(n_rows, n_cols);
        e.fill(0.0);

        for image_idx in 0..n_images {
            let object = &object_points[image_idx];
            let row0 = image_idx * 4 * n_points;
            let pose_col = 24 + 6 * image_idx;

            // Left camera: residual plus direct Jacobian columns.
            let (proj_l, jac_l) = project_points_with_jacobian(
                object,
                &poses1[image_idx],
                &left.intrinsics(),
                &left.distortion(),
            );
            for i in 0..n_points {
                e[row0 + 2 * i] = image_points1[image_idx][i].x - proj_l[i].x;
                e[row0 + 2 * i + 1] = image_points1[image_idx][i].y - proj_l[i].y;
            }
            for i in 0..2 * n_points {
                let row = row0 + i;
                for j in 0..2 {
                    jac[(row, j)] = jac_l[(i, j)];
                    jac[(row, 2 + j)] = jac_l[(i, 2 + j)];
                }
                jac[(row, 4)] = jac_l[(i, 14)];
                for j in 0..4 {
                    jac[(row, 5 + j)] = jac_l[(i, 4 + j)];
                }
                for j in 0..3 {
                    jac[(row, pose_col + j)] = jac_l[(i, 8 + j)];
                    jac[(row, pose_col + 3 + j)] = jac_l[(i, 11 + j)];
                }
            }

            // Right camera: pose composed from the view pose and the rig
            // transform, Jacobians chain-ruled through the composition.
            let (omr, tr, motion) = compose_motion(
                &poses1[image_idx].rvec,
                &poses1[image_idx].tvec,
                &omcur,
                &tcur,
            );
            let (proj_r, jac_r) = project_points_with_jacobian(
                object,
                &Pose::new(omr, tr),
                &right.intrinsics(),
                &right.distortion(),
            );
            let row1 = row0 + 2 * n_points;
            for i in 0..n_points {
                e[row1 + 2 * i] = image_points2[image_idx][i].x - proj_r[i].x;
                e[row1 + 2 * i + 1] = image_points2[image_idx][i].y - proj_r[i].y;
            }

            let j_om = jac_r.columns(8, 3);
            let j_t = jac_r.columns(11, 3);
            let dxr_domcur = j_om * motion.dom3_dom2 + j_t * motion.dt3_dom2;
            let dxr_dtcur = j_om * motion.dom3_dt2 + j_t * motion.dt3_dt2;
            let dxr_dom1 = j_om * motion.dom3_dom1 + j_t * motion.dt3_dom1;
            let dxr_dt1 = j_om * motion.dom3_dt1 + j_t * motion.dt3_dt1;

            for i in 0..2 * n_points {
                let row = row1 + i;
                for j in 0..2 {
                    jac[(row, 9 + j)] = jac_r[(i, j)];
                    jac[(row, 11 + j)] = jac_r[(i, 2 + j)];
                }
                jac[(row, 13)] = jac_r[(i, 14)];
                for j in 0..4 {
                    jac[(row, 14 + j)] = jac_r[(i, 4 + j)];
                }
                for j in 0..3 {
                    jac[(row, 18 + j)] = dxr_domcur[(i, j)];
                    jac[(row, 21 + j)] = dxr_dtcur[(i, j)];
                    jac[(row, pose_col + j)] = dxr_dom1[(i, j)];
                    jac[(row, pose_col + 3 + j)] = dxr_dt1[(i, j)];
                }
            }

            let mut abs_max = 0.0f64;
            for i in 0..4 * n_points {
                abs_max = abs_max.max(e[row0 + i].abs());
            }
            if abs_max >= BAD_PAIR_THRESHOLD {
                return Err(CalibError::BadStereoPair(format!(
                    "view {image_idx}: max residual {abs_max:.2} px exceeds {BAD_PAIR_THRESHOLD} px"
                )));
            }
        }

        let old_tom = Vector6::new(tcur.x, tcur.y, tcur.z, omcur.x, omcur.y, omcur.z);

        let all_rows = vec![true; n_rows];
        let jr = sub_matrix(&jac, &all_rows, &selected);
        let j2 = jr.transpose() * &jr;
        let j2_inv = j2.try_inverse().ok_or_else(|| {
            CalibError::DegenerateSystem("stereo_calibrate: singular normal equations".to_string())
        })?;
        let deltas = j2_inv * (jr.transpose() * &e);

        let a = left.num_estimated();
        let b = right.num_estimated();
        left = left.updated(&deltas.as_slice()[..a]);
        right = right.updated(&deltas.as_slice()[a..a + b]);
        omcur += Vector3::new(deltas[a + b], deltas[a + b + 1], deltas[a + b + 2]);
        tcur += Vector3::new(deltas[a + b + 3], deltas[a + b + 4], deltas[a + b + 5]);
        for (k, pose) in poses1.iter_mut().enumerate() {
            let off = a + b + 6 + 6 * k;
            pose.rvec += Vector3::new(deltas[off], deltas[off + 1], deltas[off + 2]);
            pose.tvec += Vector3::new(deltas[off + 3], deltas[off + 4], deltas[off + 5]);
        }

        let new_tom = Vector6::new(tcur.x, tcur.y, tcur.z, omcur.x, omcur.y, omcur.z);
        change = (new_tom - old_tom).norm() / new_tom.norm();
        iter += 1;
    }

    let mut rms = 0.0f64;
    for i in 0..n_rows {
        rms += e[i] * e[i];
    }
    rms /= n_rows as f64 / 2.0;
    let rms = rms.sqrt();

    Ok(StereoCalibrationReport {
        left,
        right,
        rvec: omcur,
        tvec: tcur,
        poses: poses1,
        rms,
    })
}

fn validate_stereo_views(
    object_points: &[Vec<Vector3<f64>>],
    image_points1: &[Vec<Vector2<f64>>],
    image_points2: &[Vec<Vector2<f64>>],
) -> Result<()> {
    if object_points.is_empty()
        || object_points.len() != image_points1.len()
        || object_points.len() != image_points2.len()
    {
        return Err(CalibError::InvalidInput(
            "stereo_calibrate: need a non-empty, equal number of object and image point sets"
                .to_string(),
        ));
    }
    let n_points = object_points[0].len();
    if n_points < 4 {
        return Err(CalibError::InvalidInput(
            "stereo_calibrate: views need at least 4 correspondences".to_string(),
        ));
    }
    for (k, ((obj, img1), img2)) in object_points
        .iter()
        .zip(image_points1.iter())
        .zip(image_points2.iter())
        .enumerate()
    {
        if obj.len() != n_points || img1.len() != n_points || img2.len() != n_points {
            return Err(CalibError::InvalidInput(format!(
                "stereo_calibrate: view {k} does not carry {n_points} points in every set"
            )));
        }
    }
    Ok(())
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2] + values[n / 2 - 1])
    }
}

fn median3(values: &[Vector3<f64>]) -> Vector3<f64> {
    Vector3::new(
        median(values.iter().map(|v| v.x).collect()),
        median(values.iter().map(|v| v.y).collect()),
        median(values.iter().map(|v| v.z).collect()),
    )
}
