//! Planar homography estimation: normalised DLT plus a fixed Gauss-Newton
//! reprojection refinement.

use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};

use crate::{CalibError, Result};

/// Homography mapping planar object points onto (normalized) image points.
///
/// The DLT solves the stacked 2Nx9 system (through its 9x9 normal matrix)
/// after centring the image points and scaling by their mean absolute
/// deviation. With more than four correspondences the result is additionally
/// polished by ten Gauss-Newton iterations over the eight free parameters of
/// the reprojection error.
pub fn compute_homography(
    image_points: &[Vector2<f64>],
    object_points: &[Vector2<f64>],
) -> Result<Matrix3<f64>> {
    let np = image_points.len();
    if np != object_points.len() {
        return Err(CalibError::InvalidInput(
            "compute_homography: image/object point counts differ".to_string(),
        ));
    }
    if np < 4 {
        return Err(CalibError::InvalidInput(
            "compute_homography needs at least 4 correspondences".to_string(),
        ));
    }

    let mxx = image_points.iter().map(|p| p.x).sum::<f64>() / np as f64;
    let myy = image_points.iter().map(|p| p.y).sum::<f64>() / np as f64;
    let scxx = image_points.iter().map(|p| (p.x - mxx).abs()).sum::<f64>() / np as f64;
    let scyy = image_points.iter().map(|p| (p.y - myy).abs()).sum::<f64>() / np as f64;
    if scxx <= f64::EPSILON || scyy <= f64::EPSILON {
        return Err(CalibError::DegenerateSystem(
            "compute_homography: image points are collinear along an axis".to_string(),
        ));
    }

    let inv_hnorm = Matrix3::new(scxx, 0.0, mxx, 0.0, scyy, myy, 0.0, 0.0, 1.0);

    let mut l = DMatrix::<f64>::zeros(2 * np, 9);
    for (i, (m, big_m)) in image_points.iter().zip(object_points.iter()).enumerate() {
        let mn = Vector2::new((m.x - mxx) / scxx, (m.y - myy) / scyy);
        let row = 2 * i;
        for (j, &mj) in [big_m.x, big_m.y, 1.0].iter().enumerate() {
            l[(row, j)] = mj;
            l[(row + 1, j + 3)] = mj;
            l[(row, j + 6)] = -mn.x * mj;
            l[(row + 1, j + 6)] = -mn.y * mj;
        }
    }

    // Decompose the 9x9 normal matrix: its SVD carries the full right basis,
    // so the null-space vector is present even for a minimal four-point set.
    let l = l.transpose() * &l;
    let svd = l.svd(false, true);
    let vt = svd.v_t.ok_or_else(|| {
        CalibError::DegenerateSystem("compute_homography: SVD failed on DLT system".to_string())
    })?;
    let hh = vt.row(vt.nrows() - 1);
    if hh[8].abs() < 1e-15 {
        return Err(CalibError::DegenerateSystem(
            "compute_homography: vanishing homogeneous scale".to_string(),
        ));
    }
    let hrem = Matrix3::new(
        hh[0] / hh[8],
        hh[1] / hh[8],
        hh[2] / hh[8],
        hh[3] / hh[8],
        hh[4] / hh[8],
        hh[5] / hh[8],
        hh[6] / hh[8],
        hh[7] / hh[8],
        1.0,
    );
    let mut h = inv_hnorm * hrem;

    if np > 4 {
        h = refine_homography(h, image_points, object_points)?;
    }
    Ok(h)
}

// Ten Gauss-Newton iterations on the eight free parameters (H[(2,2)] fixed
// at 1) against the reprojection error of the raw correspondences.
fn refine_homography(
    mut h: Matrix3<f64>,
    image_points: &[Vector2<f64>],
    object_points: &[Vector2<f64>],
) -> Result<Matrix3<f64>> {
    let np = image_points.len();
    let mut hhv = [
        h[(0, 0)],
        h[(0, 1)],
        h[(0, 2)],
        h[(1, 0)],
        h[(1, 1)],
        h[(1, 2)],
        h[(2, 0)],
        h[(2, 1)],
    ];

    for _ in 0..10 {
        let mut jac = DMatrix::<f64>::zeros(2 * np, 8);
        let mut err = DVector::<f64>::zeros(2 * np);

        for (i, (m, big_m)) in image_points.iter().zip(object_points.iter()).enumerate() {
            let mrep = h * Vector3::new(big_m.x, big_m.y, 1.0);
            let mmm = Vector3::new(big_m.x / mrep.z, big_m.y / mrep.z, 1.0 / mrep.z);
            let rep = Vector2::new(mrep.x / mrep.z, mrep.y / mrep.z);

            let row = 2 * i;
            err[row] = m.x - rep.x;
            err[row + 1] = m.y - rep.y;

            for j in 0..3 {
                jac[(row, j)] = -mmm[j];
                jac[(row + 1, j + 3)] = -mmm[j];
            }
            for j in 0..2 {
                jac[(row, j + 6)] = rep.x * mmm[j];
                jac[(row + 1, j + 6)] = rep.y * mmm[j];
            }
        }

        let jtj = jac.transpose() * &jac;
        let jte = jac.transpose() * &err;
        let innov = jtj.lu().solve(&jte).ok_or_else(|| {
            CalibError::DegenerateSystem(
                "compute_homography: singular normal matrix in refinement".to_string(),
            )
        })?;

        for (v, d) in hhv.iter_mut().zip(innov.iter()) {
            *v -= d;
        }
        h = Matrix3::new(
            hhv[0], hhv[1], hhv[2], hhv[3], hhv[4], hhv[5], hhv[6], hhv[7], 1.0,
        );
    }

    Ok(h)
}
