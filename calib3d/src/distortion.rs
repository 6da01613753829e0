//! Per-point distortion, iterative undistortion and dense rectification maps.

use fisheye_core::{rodrigues, CameraIntrinsics, FisheyeDistortion};
use nalgebra::{Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use crate::{CalibError, Result};

/// Sub-pixel bits used by the fixed-point map encoding.
pub const INTER_BITS: u32 = 5;
/// Side length of the bilinear interpolation table; the fixed-point map
/// stores an index into a table of `INTER_TAB_SIZE^2` weight quadruples.
pub const INTER_TAB_SIZE: i32 = 1 << INTER_BITS;

/// Rectification rotation accepted either as a 3x3 matrix or as a Rodrigues
/// vector.
#[derive(Debug, Clone, Copy)]
pub enum RotationSpec {
    Matrix(Matrix3<f64>),
    Rodrigues(Vector3<f64>),
}

impl RotationSpec {
    pub fn matrix(&self) -> Matrix3<f64> {
        match self {
            RotationSpec::Matrix(m) => *m,
            RotationSpec::Rodrigues(v) => rodrigues(v),
        }
    }
}

/// Distort normalized camera points and map them to pixels through the
/// camera matrix (including the skew term).
pub fn distort_points(
    undistorted: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> Vec<Vector2<f64>> {
    let mut out = Vec::with_capacity(undistorted.len());
    for p in undistorted {
        let (xd, yd) = distortion.apply(p.x, p.y);
        let xs = xd + intrinsics.alpha * yd;
        out.push(Vector2::new(
            xs * intrinsics.fx + intrinsics.cx,
            yd * intrinsics.fy + intrinsics.cy,
        ));
    }
    out
}

/// Undistort pixels back to normalized coordinates, optionally rotating by
/// `rectification` and reprojecting through `projection`.
///
/// Each pixel is normalized through the camera matrix (skew compensated),
/// the distorted angle is inverted by the fixed ten-iteration scheme, and the
/// result is reprojected through `projection * rectification` when either is
/// given.
pub fn undistort_points(
    distorted: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    rectification: Option<&RotationSpec>,
    projection: Option<&Matrix3<f64>>,
) -> Vec<Vector2<f64>> {
    let mut rr = rectification.map_or_else(Matrix3::identity, |r| r.matrix());
    if let Some(p) = projection {
        rr = p * rr;
    }

    let mut out = Vec::with_capacity(distorted.len());
    for pi in distorted {
        let mut pw = Vector2::new(
            (pi.x - intrinsics.cx) / intrinsics.fx,
            (pi.y - intrinsics.cy) / intrinsics.fy,
        );
        pw.x -= intrinsics.alpha * pw.y;

        let theta_d = pw.norm();
        let scale = if theta_d > 1e-8 {
            distortion.undistort_angle(theta_d).tan() / theta_d
        } else {
            1.0
        };

        let pu = pw * scale;
        let pr = rr * Vector3::new(pu.x, pu.y, 1.0);
        out.push(Vector2::new(pr.x / pr.z, pr.y / pr.z));
    }
    out
}

/// Fixed-point rectification maps: per-pixel integer source coordinates plus
/// an index into the `INTER_TAB_SIZE^2` bilinear weight table.
#[derive(Debug, Clone)]
pub struct FixedPointMaps {
    pub coords: Vec<[i16; 2]>,
    pub fractions: Vec<u16>,
}

/// Dense float undistortion/rectification maps for a `size.0 x size.1`
/// destination image. `maps.0[y * w + x]` / `maps.1[y * w + x]` hold the
/// source pixel for destination `(x, y)`.
pub fn init_undistort_rectify_map(
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    rectification: Option<&RotationSpec>,
    new_camera: Option<&Matrix3<f64>>,
    size: (u32, u32),
) -> Result<(Vec<f32>, Vec<f32>)> {
    let ir = inverse_rectification(rectification, new_camera, size)?;
    let (width, height) = (size.0 as usize, size.1 as usize);

    let mut map_x = vec![0.0f32; width * height];
    let mut map_y = vec![0.0f32; width * height];

    map_x
        .par_chunks_mut(width)
        .zip(map_y.par_chunks_mut(width))
        .enumerate()
        .for_each(|(i, (row_x, row_y))| {
            let mut x = i as f64 * ir[(0, 1)] + ir[(0, 2)];
            let mut y = i as f64 * ir[(1, 1)] + ir[(1, 2)];
            let mut w = i as f64 * ir[(2, 1)] + ir[(2, 2)];
            for j in 0..width {
                let (u, v) = map_source_pixel(x / w, y / w, intrinsics, distortion);
                row_x[j] = u as f32;
                row_y[j] = v as f32;
                x += ir[(0, 0)];
                y += ir[(1, 0)];
                w += ir[(2, 0)];
            }
        });

    Ok((map_x, map_y))
}

/// Same as [`init_undistort_rectify_map`] in the fixed-point encoding used by
/// integer remappers: `coords = (iu >> INTER_BITS, iv >> INTER_BITS)` and
/// `fractions = (iv & (TAB-1)) * TAB + (iu & (TAB-1))` with
/// `iu = round(u * INTER_TAB_SIZE)`.
pub fn init_undistort_rectify_map_fixed(
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
    rectification: Option<&RotationSpec>,
    new_camera: Option<&Matrix3<f64>>,
    size: (u32, u32),
) -> Result<FixedPointMaps> {
    let ir = inverse_rectification(rectification, new_camera, size)?;
    let (width, height) = (size.0 as usize, size.1 as usize);

    let mut coords = vec![[0i16; 2]; width * height];
    let mut fractions = vec![0u16; width * height];

    coords
        .par_chunks_mut(width)
        .zip(fractions.par_chunks_mut(width))
        .enumerate()
        .for_each(|(i, (row_c, row_f))| {
            let mut x = i as f64 * ir[(0, 1)] + ir[(0, 2)];
            let mut y = i as f64 * ir[(1, 1)] + ir[(1, 2)];
            let mut w = i as f64 * ir[(2, 1)] + ir[(2, 2)];
            for j in 0..width {
                let (u, v) = map_source_pixel(x / w, y / w, intrinsics, distortion);
                let iu = (u * INTER_TAB_SIZE as f64).round() as i32;
                let iv = (v * INTER_TAB_SIZE as f64).round() as i32;
                row_c[j] = [(iu >> INTER_BITS) as i16, (iv >> INTER_BITS) as i16];
                row_f[j] =
                    ((iv & (INTER_TAB_SIZE - 1)) * INTER_TAB_SIZE + (iu & (INTER_TAB_SIZE - 1)))
                        as u16;
                x += ir[(0, 0)];
                y += ir[(1, 0)];
                w += ir[(2, 0)];
            }
        });

    Ok(FixedPointMaps { coords, fractions })
}

// (P * R)^-1 via SVD pseudo-inverse; P may be ill-conditioned.
fn inverse_rectification(
    rectification: Option<&RotationSpec>,
    new_camera: Option<&Matrix3<f64>>,
    size: (u32, u32),
) -> Result<Matrix3<f64>> {
    if size.0 == 0 || size.1 == 0 {
        return Err(CalibError::InvalidInput(
            "init_undistort_rectify_map requires a non-zero destination size".to_string(),
        ));
    }
    let r = rectification.map_or_else(Matrix3::identity, |r| r.matrix());
    let p = new_camera.copied().unwrap_or_else(Matrix3::identity);
    (p * r)
        .svd(true, true)
        .pseudo_inverse(f64::EPSILON)
        .map_err(|e| CalibError::DegenerateSystem(e.to_string()))
}

// Forward fisheye model for map generation. The alpha skew term is not
// applied here; the maps are always built for a skew-free source camera.
fn map_source_pixel(
    x: f64,
    y: f64,
    intrinsics: &CameraIntrinsics,
    distortion: &FisheyeDistortion,
) -> (f64, f64) {
    let r = (x * x + y * y).sqrt();
    let theta = r.atan();
    let theta_d = distortion.distort_angle(theta);
    let scale = if r == 0.0 { 1.0 } else { theta_d / r };
    (
        intrinsics.fx * x * scale + intrinsics.cx,
        intrinsics.fy * y * scale + intrinsics.cy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distort_then_undistort_recovers_grid() {
        let intr = CameraIntrinsics::new(1.0, 1.0, 0.0, 0.0);
        let dist = FisheyeDistortion::new(0.02, -0.005, 0.001, -0.0002);

        let r_max = (80.0f64).to_radians().tan();
        let mut grid = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                let angle = i as f64 * std::f64::consts::FRAC_PI_4;
                let radius = r_max * (j as f64 + 0.5) / 8.0;
                grid.push(Vector2::new(radius * angle.cos(), radius * angle.sin()));
            }
        }

        let distorted = distort_points(&grid, &intr, &dist);
        let recovered = undistort_points(&distorted, &intr, &dist, None, None);
        for (p, q) in grid.iter().zip(recovered.iter()) {
            let tol = 1e-6 * p.norm().max(1.0);
            assert!((p - q).norm() < tol, "{p:?} -> {q:?}");
        }
    }

    #[test]
    fn undistortion_converges_to_twelve_digits() {
        let intr = CameraIntrinsics::identity();
        let dist = FisheyeDistortion::new(0.1, 0.0, 0.0, 0.0);

        let x = vec![Vector2::new(0.3, 0.0)];
        let distorted = distort_points(&x, &intr, &dist);
        let recovered = undistort_points(&distorted, &intr, &dist, None, None);
        assert!((recovered[0].x - 0.3).abs() < 1e-12);
        assert!(recovered[0].y.abs() < 1e-12);
    }

    #[test]
    fn undistort_applies_rotation_and_projection() {
        let intr = CameraIntrinsics::new(400.0, 400.0, 320.0, 240.0);
        let dist = FisheyeDistortion::none();

        let rot = RotationSpec::Rodrigues(Vector3::new(0.0, 0.1, 0.0));
        let proj = Matrix3::new(200.0, 0.0, 100.0, 0.0, 200.0, 50.0, 0.0, 0.0, 1.0);

        let pixel = Vector2::new(360.0, 230.0);
        let out = undistort_points(&[pixel], &intr, &dist, Some(&rot), Some(&proj))[0];

        // With zero distortion the inversion reduces to scale = tan(r)/r.
        let pw: Vector2<f64> = Vector2::new((360.0 - 320.0) / 400.0, (230.0 - 240.0) / 400.0);
        let theta_d = pw.norm();
        let pu = pw * (theta_d.tan() / theta_d);
        let pr = proj * rodrigues(&Vector3::new(0.0, 0.1, 0.0)) * Vector3::new(pu.x, pu.y, 1.0);
        let expected = Vector2::new(pr.x / pr.z, pr.y / pr.z);
        assert!((out - expected).norm() < 1e-10);
    }

    #[test]
    fn skew_is_compensated_before_inversion() {
        let intr = CameraIntrinsics::with_skew(350.0, 340.0, 300.0, 200.0, 0.05);
        let dist = FisheyeDistortion::new(0.03, -0.004, 0.0, 0.0);

        let normalized = vec![Vector2::new(0.25, -0.15)];
        let distorted = distort_points(&normalized, &intr, &dist);
        let recovered = undistort_points(&distorted, &intr, &dist, None, None);
        assert!((recovered[0] - normalized[0]).norm() < 1e-9);
    }

    #[test]
    fn map_generation_is_idempotent() {
        let intr = CameraIntrinsics::new(120.0, 118.0, 64.0, 48.0);
        let dist = FisheyeDistortion::new(0.05, -0.01, 0.002, -0.0004);
        let size = (128u32, 96u32);

        let (ax, ay) = init_undistort_rectify_map(&intr, &dist, None, None, size).unwrap();
        let (bx, by) = init_undistort_rectify_map(&intr, &dist, None, None, size).unwrap();
        assert_eq!(ax, bx);
        assert_eq!(ay, by);

        let fa = init_undistort_rectify_map_fixed(&intr, &dist, None, None, size).unwrap();
        let fb = init_undistort_rectify_map_fixed(&intr, &dist, None, None, size).unwrap();
        assert_eq!(fa.coords, fb.coords);
        assert_eq!(fa.fractions, fb.fractions);
    }

    #[test]
    fn fixed_point_packing_layout() {
        // Destination pixel (0, 0) with a unit new camera maps straight to the
        // principal point, so pick it to hit the continuous (10.25, 20.75).
        let intr = CameraIntrinsics::new(1.0, 1.0, 10.25, 20.75);
        let dist = FisheyeDistortion::none();

        let maps = init_undistort_rectify_map_fixed(&intr, &dist, None, None, (4, 4)).unwrap();
        assert_eq!(maps.coords[0], [10, 20]);
        assert_eq!(maps.fractions[0], 24 * 32 + 8);
        assert_eq!(maps.fractions[0], 776);
    }

    #[test]
    fn fixed_point_maps_agree_with_float_maps() {
        let intr = CameraIntrinsics::new(95.0, 93.0, 63.5, 47.5);
        let dist = FisheyeDistortion::new(0.08, -0.02, 0.003, -0.0005);
        let size = (64u32, 48u32);

        let (mx, my) = init_undistort_rectify_map(&intr, &dist, None, None, size).unwrap();
        let fixed = init_undistort_rectify_map_fixed(&intr, &dist, None, None, size).unwrap();

        let tab = INTER_TAB_SIZE as f64;
        for idx in 0..(size.0 * size.1) as usize {
            let frac = fixed.fractions[idx] as i32;
            let u = fixed.coords[idx][0] as f64 + (frac % INTER_TAB_SIZE) as f64 / tab;
            let v = fixed.coords[idx][1] as f64 + (frac / INTER_TAB_SIZE) as f64 / tab;
            assert!((u - mx[idx] as f64).abs() <= 1.0 / tab);
            assert!((v - my[idx] as f64).abs() <= 1.0 / tab);
        }
    }

    #[test]
    fn zero_size_is_rejected() {
        let intr = CameraIntrinsics::identity();
        let dist = FisheyeDistortion::none();
        assert!(init_undistort_rectify_map(&intr, &dist, None, None, (0, 4)).is_err());
    }
}
