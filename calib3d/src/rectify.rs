//! Rectification planning: a virtual camera matrix exposing a requested
//! field of view, and the pair of rotations that row-align a stereo rig.

use fisheye_core::{rodrigues, rotation_to_rodrigues, CameraIntrinsics, FisheyeDistortion};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};

use crate::distortion::{undistort_points, RotationSpec};
use crate::{CalibError, Result};

/// Where the image boundary is sampled when estimating the rectified camera.
///
/// `MidEdges` probes the four edge midpoints. `PerSide(n)` spreads `n`
/// samples along each edge instead, which covers wide fields of view better.
#[derive(Debug, Clone, Copy)]
pub enum BoundarySampling {
    MidEdges,
    PerSide(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct NewCameraMatrixOptions {
    /// Blend between the focal that keeps every source pixel visible (1) and
    /// the focal that fills the destination with valid pixels (0).
    pub balance: f64,
    /// Divides the final focal length; values above 1 widen the view.
    pub fov_scale: f64,
    /// Destination resolution when it differs from the source image size.
    pub new_size: Option<(u32, u32)>,
    pub sampling: BoundarySampling,
}

impl Default for NewCameraMatrixOptions {
    fn default() -> Self {
        Self {
            balance: 0.0,
            fov_scale: 1.0,
            new_size: None,
            sampling: BoundarySampling::MidEdges,
        }
    }
}

/// Estimate the camera matrix of a rectified (pinhole) view of the fisheye
/// image, exposing the field of view selected by `options`.
pub fn estimate_new_camera_matrix_for_undistort_rectify(
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    image_size: (u32, u32),
    rectification: Option<&RotationSpec>,
    options: &NewCameraMatrixOptions,
) -> Result<Matrix3<f64>> {
    let w = image_size.0 as i64;
    let h = image_size.1 as i64;
    if w == 0 || h == 0 {
        return Err(CalibError::InvalidInput(
            "estimate_new_camera_matrix: empty image size".to_string(),
        ));
    }
    let balance = options.balance.clamp(0.0, 1.0);

    let boundary: Vec<Vector2<f64>> = match options.sampling {
        BoundarySampling::MidEdges => vec![
            Vector2::new((w / 2) as f64, 0.0),
            Vector2::new(w as f64, (h / 2) as f64),
            Vector2::new((w / 2) as f64, h as f64),
            Vector2::new(0.0, (h / 2) as f64),
        ],
        BoundarySampling::PerSide(n) => {
            if n == 0 {
                return Err(CalibError::InvalidInput(
                    "estimate_new_camera_matrix: PerSide sampling needs n >= 1".to_string(),
                ));
            }
            let n = n as i64;
            let mut pts = Vec::with_capacity(4 * n as usize);
            for i in 0..n {
                pts.push(Vector2::new((w / 2 - w / 8 + w / 4 / n * i) as f64, 0.0));
                pts.push(Vector2::new(
                    (w / 2 - w / 8 + w / 4 / n * i) as f64,
                    (h - 1) as f64,
                ));
                pts.push(Vector2::new(0.0, (h / 2 - h / 8 + h / 4 / n * i) as f64));
                pts.push(Vector2::new(
                    (w - 1) as f64,
                    (h / 2 - h / 8 + h / 4 / n * i) as f64,
                ));
            }
            pts
        }
    };

    let mut points = undistort_points(&boundary, intrinsics, distortion, rectification, None);

    let mut cn = points.iter().sum::<Vector2<f64>>() / points.len() as f64;

    // Work in a space where the two focals are equal, then undo at the end.
    let aspect_ratio = intrinsics.fx / intrinsics.fy;
    cn.y *= aspect_ratio;
    for p in points.iter_mut() {
        p.y *= aspect_ratio;
    }

    let mut minx = f64::MAX;
    let mut miny = f64::MAX;
    let mut maxx = f64::MIN;
    let mut maxy = f64::MIN;
    for p in &points {
        minx = minx.min(p.x);
        maxx = maxx.max(p.x);
        miny = miny.min(p.y);
        maxy = maxy.max(p.y);
    }

    let f1 = w as f64 * 0.5 / (cn.x - minx);
    let f2 = w as f64 * 0.5 / (maxx - cn.x);
    let f3 = h as f64 * 0.5 * aspect_ratio / (cn.y - miny);
    let f4 = h as f64 * 0.5 * aspect_ratio / (maxy - cn.y);

    let fmin = f1.min(f2).min(f3.min(f4));
    let fmax = f1.max(f2).max(f3.max(f4));

    let mut f = balance * fmin + (1.0 - balance) * fmax;
    if options.fov_scale > 0.0 {
        f /= options.fov_scale;
    }

    let mut new_f = Vector2::new(f, f);
    let mut new_c = -cn * f + Vector2::new(w as f64, h as f64 * aspect_ratio) * 0.5;

    new_f.y /= aspect_ratio;
    new_c.y /= aspect_ratio;

    if let Some((nw, nh)) = options.new_size {
        let rx = nw as f64 / w as f64;
        let ry = nh as f64 / h as f64;
        new_f.x *= rx;
        new_f.y *= ry;
        new_c.x *= rx;
        new_c.y *= ry;
    }

    if !(new_f.x.is_finite() && new_f.y.is_finite() && new_c.x.is_finite() && new_c.y.is_finite()) {
        return Err(CalibError::DegenerateSystem(
            "estimate_new_camera_matrix: boundary points collapse onto the centre".to_string(),
        ));
    }

    Ok(Matrix3::new(
        new_f.x, 0.0, new_c.x, 0.0, new_f.y, new_c.y, 0.0, 0.0, 1.0,
    ))
}

/// Rotations, projections and the disparity-to-depth matrix of a rectified
/// stereo pair.
#[derive(Debug, Clone)]
pub struct StereoRectification {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub q: Matrix4<f64>,
}

/// Compute the rectifying rotations and projections of a calibrated stereo
/// rig, given the transform `(rotation, tvec)` from camera 1 to camera 2.
///
/// Both cameras are rotated halfway towards each other, then together so the
/// baseline lands on the x axis; the shared focal is the smaller of the two
/// estimated rectified focals. With `zero_disparity` both principal points
/// are averaged, otherwise only the y components.
#[allow(clippy::too_many_arguments)]
pub fn stereo_rectify(
    k1: &CameraIntrinsics,
    d1: &FisheyeDistortion,
    k2: &CameraIntrinsics,
    d2: &FisheyeDistortion,
    image_size: (u32, u32),
    rotation: &RotationSpec,
    tvec: &Vector3<f64>,
    zero_disparity: bool,
    options: &NewCameraMatrixOptions,
) -> Result<StereoRectification> {
    if tvec.norm() <= 1e-12 {
        return Err(CalibError::InvalidInput(
            "stereo_rectify requires a non-zero baseline".to_string(),
        ));
    }

    let rvec = match rotation {
        RotationSpec::Matrix(m) => rotation_to_rodrigues(m),
        RotationSpec::Rodrigues(v) => *v,
    };

    // Halfway rotation brings both cameras to the average orientation.
    let r_r = rodrigues(&(rvec * -0.5));
    let t = r_r * tvec;
    let uu = Vector3::new(if t.x > 0.0 { 1.0 } else { -1.0 }, 0.0, 0.0);

    // Rotation taking the (averaged) baseline onto the x axis.
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (t.x.abs() / t.norm()).acos() / nw;
    }
    let wr = rodrigues(&ww);

    let r1 = wr * r_r.transpose();
    let r2 = wr * r_r;
    let tnew = r2 * tvec;

    let new_k1 = estimate_new_camera_matrix_for_undistort_rectify(
        k1,
        d1,
        image_size,
        Some(&RotationSpec::Matrix(r1)),
        options,
    )?;
    let new_k2 = estimate_new_camera_matrix_for_undistort_rectify(
        k2,
        d2,
        image_size,
        Some(&RotationSpec::Matrix(r2)),
        options,
    )?;

    // The vertical focal must match between views to keep epipolar lines on
    // shared scanlines, so it is also used horizontally.
    let fc_new = new_k1[(1, 1)].min(new_k2[(1, 1)]);
    let mut cc1 = Vector2::new(new_k1[(0, 2)], new_k1[(1, 2)]);
    let mut cc2 = Vector2::new(new_k2[(0, 2)], new_k2[(1, 2)]);
    if zero_disparity {
        let avg = (cc1 + cc2) * 0.5;
        cc1 = avg;
        cc2 = avg;
    } else {
        let avg_y = (cc1.y + cc2.y) * 0.5;
        cc1.y = avg_y;
        cc2.y = avg_y;
    }

    let p1 = Matrix3x4::new(
        fc_new, 0.0, cc1.x, 0.0, //
        0.0, fc_new, cc1.y, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let p2 = Matrix3x4::new(
        fc_new,
        0.0,
        cc2.x,
        tnew.x * fc_new, // baseline times focal length
        0.0,
        fc_new,
        cc2.y,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
    );

    let q = Matrix4::new(
        1.0,
        0.0,
        0.0,
        -cc1.x,
        0.0,
        1.0,
        0.0,
        -cc1.y,
        0.0,
        0.0,
        0.0,
        fc_new,
        0.0,
        0.0,
        -1.0 / tnew.x,
        (cc1.x - cc2.x) / tnew.x,
    );

    Ok(StereoRectification { r1, r2, p1, p2, q })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrow_camera() -> CameraIntrinsics {
        CameraIntrinsics::new(320.0, 320.0, 320.0, 240.0)
    }

    #[test]
    fn symmetric_camera_keeps_centre_and_scales_focal() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::none();
        let opts = NewCameraMatrixOptions::default();

        let k = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &opts,
        )
        .unwrap();

        // Vertical extremes dominate: f = (h/2) / tan(240/320).
        let expected_f = 240.0 / (240.0f64 / 320.0).tan();
        assert!((k[(0, 0)] - expected_f).abs() < 1e-9);
        assert!((k[(1, 1)] - expected_f).abs() < 1e-9);
        assert!((k[(0, 2)] - 320.0).abs() < 1e-9);
        assert!((k[(1, 2)] - 240.0).abs() < 1e-9);
    }

    #[test]
    fn balance_selects_between_min_and_max_focal() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::none();

        let k_fit = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &NewCameraMatrixOptions::default(),
        )
        .unwrap();
        let k_all = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &NewCameraMatrixOptions {
                balance: 1.0,
                ..Default::default()
            },
        )
        .unwrap();

        // balance = 1 keeps the whole image visible: smaller focal.
        assert!(k_all[(0, 0)] < k_fit[(0, 0)]);
        let expected_min = 320.0 / 1.0f64.tan();
        assert!((k_all[(0, 0)] - expected_min).abs() < 1e-9);
    }

    #[test]
    fn fov_scale_divides_the_focal() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::new(0.02, -0.004, 0.001, -0.0002);

        let base = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &NewCameraMatrixOptions::default(),
        )
        .unwrap();
        let wide = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &NewCameraMatrixOptions {
                fov_scale: 2.0,
                ..Default::default()
            },
        )
        .unwrap();
        assert!((wide[(0, 0)] - base[(0, 0)] / 2.0).abs() < 1e-9);
    }

    #[test]
    fn per_side_sampling_is_supported() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::new(0.01, 0.0, 0.0, 0.0);
        let opts = NewCameraMatrixOptions {
            sampling: BoundarySampling::PerSide(10),
            ..Default::default()
        };
        let k = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &opts,
        )
        .unwrap();
        assert!(k[(0, 0)].is_finite() && k[(0, 0)] > 0.0);
        assert!(
            estimate_new_camera_matrix_for_undistort_rectify(
                &intr,
                &dist,
                (640, 480),
                None,
                &NewCameraMatrixOptions {
                    sampling: BoundarySampling::PerSide(0),
                    ..Default::default()
                },
            )
            .is_err()
        );
    }

    #[test]
    fn axis_aligned_baseline_keeps_identity_rotations() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::none();
        let tvec = Vector3::new(-0.1, 0.0, 0.0);

        let rect = stereo_rectify(
            &intr,
            &dist,
            &intr,
            &dist,
            (640, 480),
            &RotationSpec::Rodrigues(Vector3::zeros()),
            &tvec,
            false,
            &NewCameraMatrixOptions::default(),
        )
        .unwrap();

        assert!((rect.r1 - Matrix3::identity()).norm() < 1e-12);
        assert!((rect.r2 - Matrix3::identity()).norm() < 1e-12);

        // Baseline lands in P2's last column as tnew.x * fc.
        let fc = rect.p2[(0, 0)];
        assert!((rect.p2[(0, 3)] - (-0.1) * fc).abs() < 1e-9);
        assert_eq!(rect.p1[(0, 3)], 0.0);

        // Disparity-to-depth matrix wiring.
        assert!((rect.q[(2, 3)] - fc).abs() < 1e-12);
        assert!((rect.q[(3, 2)] - (-1.0 / -0.1)).abs() < 1e-9);
    }

    #[test]
    fn p2_baseline_entry_for_500px_focal_and_5cm_baseline() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::none();
        let tvec = Vector3::new(-0.05, 0.0, 0.0);

        // Identity rotation and a pure-x baseline keep tnew at exactly
        // (-0.05, 0, 0); fov_scale normalises the estimated focal to 500 px.
        let base = estimate_new_camera_matrix_for_undistort_rectify(
            &intr,
            &dist,
            (640, 480),
            None,
            &NewCameraMatrixOptions::default(),
        )
        .unwrap();
        let opts = NewCameraMatrixOptions {
            fov_scale: base[(1, 1)] / 500.0,
            ..Default::default()
        };

        let rect = stereo_rectify(
            &intr,
            &dist,
            &intr,
            &dist,
            (640, 480),
            &RotationSpec::Rodrigues(Vector3::zeros()),
            &tvec,
            false,
            &opts,
        )
        .unwrap();

        let tnew = rect.r2 * tvec;
        assert!((tnew - tvec).norm() < 1e-12);
        assert!((rect.p2[(0, 0)] - 500.0).abs() < 1e-9);
        assert!((rect.p2[(0, 3)] - (-25.0)).abs() < 1e-9);
    }

    #[test]
    fn rectified_projections_share_scanlines() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::none();
        let rvec = Vector3::new(0.01, -0.03, 0.02);
        let tvec = Vector3::new(-0.12, 0.005, 0.002);

        let rect = stereo_rectify(
            &intr,
            &dist,
            &intr,
            &dist,
            (640, 480),
            &RotationSpec::Rodrigues(rvec),
            &tvec,
            false,
            &NewCameraMatrixOptions::default(),
        )
        .unwrap();

        let rot = rodrigues(&rvec);
        for p in [
            Vector3::new(0.2, -0.1, 2.0),
            Vector3::new(-0.3, 0.25, 3.0),
            Vector3::new(0.05, 0.4, 1.5),
        ] {
            let x1 = rect.r1 * p;
            let y1 = rect.p1[(1, 1)] * x1.y / x1.z + rect.p1[(1, 2)];

            let x2 = rect.r2 * (rot * p + tvec);
            let y2 = rect.p2[(1, 1)] * x2.y / x2.z + rect.p2[(1, 2)];

            assert!((y1 - y2).abs() < 1e-8, "scanline mismatch: {y1} vs {y2}");
        }
    }

    #[test]
    fn zero_disparity_aligns_both_principal_points() {
        let k1 = narrow_camera();
        let k2 = CameraIntrinsics::new(318.0, 322.0, 316.0, 243.0);
        let dist = FisheyeDistortion::new(0.01, -0.002, 0.0, 0.0);
        let d2 = FisheyeDistortion::new(0.012, -0.003, 0.0, 0.0);
        let tvec = Vector3::new(-0.15, 0.01, 0.0);

        let rect = stereo_rectify(
            &k1,
            &dist,
            &k2,
            &d2,
            (640, 480),
            &RotationSpec::Rodrigues(Vector3::new(0.02, 0.01, -0.005)),
            &tvec,
            true,
            &NewCameraMatrixOptions::default(),
        )
        .unwrap();

        assert!((rect.p1[(0, 2)] - rect.p2[(0, 2)]).abs() < 1e-12);
        assert!((rect.p1[(1, 2)] - rect.p2[(1, 2)]).abs() < 1e-12);
    }

    #[test]
    fn zero_baseline_is_rejected() {
        let intr = narrow_camera();
        let dist = FisheyeDistortion::none();
        let err = stereo_rectify(
            &intr,
            &dist,
            &intr,
            &dist,
            (640, 480),
            &RotationSpec::Rodrigues(Vector3::zeros()),
            &Vector3::zeros(),
            false,
            &NewCameraMatrixOptions::default(),
        );
        assert!(err.is_err());
    }
}
