//! Intrinsic parameter block shared by the calibration loops.

use fisheye_core::{CameraIntrinsics, FisheyeDistortion};
use nalgebra::{Matrix3, Vector2, Vector4};

/// Fisheye intrinsics under estimation: focal lengths, principal point, four
/// distortion coefficients, skew, and the estimate mask.
///
/// The mask is indexed in the canonical order
/// `(fx, fy, cx, cy, alpha, k1, k2, k3, k4)` and stays fixed for the lifetime
/// of one calibration run. Packed delta vectors produced by the normal
/// equations use a different order — see [`updated`](Self::updated).
#[derive(Debug, Clone, Copy)]
pub struct IntrinsicParams {
    pub f: Vector2<f64>,
    pub c: Vector2<f64>,
    pub k: Vector4<f64>,
    pub alpha: f64,
    pub is_estimate: [bool; 9],
}

impl Default for IntrinsicParams {
    fn default() -> Self {
        Self {
            f: Vector2::zeros(),
            c: Vector2::zeros(),
            k: Vector4::zeros(),
            alpha: 0.0,
            is_estimate: [false; 9],
        }
    }
}

impl IntrinsicParams {
    pub fn new(f: Vector2<f64>, c: Vector2<f64>, k: Vector4<f64>, alpha: f64) -> Self {
        Self {
            f,
            c,
            k,
            alpha,
            is_estimate: [false; 9],
        }
    }

    /// Heuristic seed used when no intrinsic guess is supplied:
    /// `f = max(w, h) / pi` and the principal point at the image centre
    /// (pixel-centre convention, hence the half-pixel shift).
    pub fn from_image_size(image_size: (u32, u32)) -> Self {
        let focal = image_size.0.max(image_size.1) as f64 / std::f64::consts::PI;
        Self {
            f: Vector2::new(focal, focal),
            c: Vector2::new(
                image_size.0 as f64 / 2.0 - 0.5,
                image_size.1 as f64 / 2.0 - 0.5,
            ),
            k: Vector4::zeros(),
            alpha: 0.0,
            is_estimate: [false; 9],
        }
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::with_skew(self.f.x, self.f.y, self.c.x, self.c.y, self.alpha)
    }

    pub fn distortion(&self) -> FisheyeDistortion {
        FisheyeDistortion::from_vector(&self.k)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics().matrix()
    }

    pub fn num_estimated(&self) -> usize {
        self.is_estimate.iter().filter(|&&b| b).count()
    }

    /// Additive update from a packed delta vector. Only masked-in components
    /// consume a slot; the slots are consumed in the order
    /// `fx, fy, cx, alpha, cy, k1, k2, k3, k4`.
    ///
    /// Alpha sits between the two principal-point components even though the
    /// estimate mask lists it at index 4; the normal-equation assembly packs
    /// its column into the same slot.
    #[must_use]
    pub fn updated(&self, delta: &[f64]) -> Self {
        assert!(
            delta.len() >= self.num_estimated(),
            "delta vector shorter than the estimate mask"
        );
        let mut it = delta.iter();
        let mut take = |on: bool| if on { *it.next().unwrap() } else { 0.0 };

        let mut out = *self;
        out.f.x += take(self.is_estimate[0]);
        out.f.y += take(self.is_estimate[1]);
        out.c.x += take(self.is_estimate[2]);
        out.alpha += take(self.is_estimate[4]);
        out.c.y += take(self.is_estimate[3]);
        out.k[0] += take(self.is_estimate[5]);
        out.k[1] += take(self.is_estimate[6]);
        out.k[2] += take(self.is_estimate[7]);
        out.k[3] += take(self.is_estimate[8]);
        out
    }

    /// Overwrite the masked components from a packed vector, consumed in the
    /// canonical mask order `fx, fy, cx, cy, alpha, k1..k4`; every unmasked
    /// component is zeroed.
    pub fn assign(&mut self, values: &[f64]) {
        assert!(
            values.len() >= self.num_estimated(),
            "value vector shorter than the estimate mask"
        );
        let mut it = values.iter();
        let mut take = |on: bool| if on { *it.next().unwrap() } else { 0.0 };

        self.f.x = take(self.is_estimate[0]);
        self.f.y = take(self.is_estimate[1]);
        self.c.x = take(self.is_estimate[2]);
        self.c.y = take(self.is_estimate[3]);
        self.alpha = take(self.is_estimate[4]);
        self.k[0] = take(self.is_estimate[5]);
        self.k[1] = take(self.is_estimate[6]);
        self.k[2] = take(self.is_estimate[7]);
        self.k[3] = take(self.is_estimate[8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_from_image_size() {
        let p = IntrinsicParams::from_image_size((640, 480));
        assert!((p.f.x - 640.0 / std::f64::consts::PI).abs() < 1e-12);
        assert!((p.f.x - 203.718_33).abs() < 1e-5);
        assert_eq!(p.f.y, p.f.x);
        assert_eq!(p.c.x, 319.5);
        assert_eq!(p.c.y, 239.5);
    }

    #[test]
    fn update_consumes_alpha_between_principal_components() {
        let mut p = IntrinsicParams::new(
            Vector2::new(100.0, 101.0),
            Vector2::new(50.0, 51.0),
            Vector4::zeros(),
            0.0,
        );
        p.is_estimate = [true; 9];

        let q = p.updated(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(q.f.x, 101.0);
        assert_eq!(q.f.y, 103.0);
        assert_eq!(q.c.x, 53.0);
        assert_eq!(q.alpha, 4.0);
        assert_eq!(q.c.y, 56.0);
        assert_eq!(q.k[0], 6.0);
        assert_eq!(q.k[3], 9.0);
    }

    #[test]
    fn unmasked_components_do_not_consume_slots() {
        let mut p = IntrinsicParams::new(
            Vector2::new(100.0, 101.0),
            Vector2::new(50.0, 51.0),
            Vector4::zeros(),
            0.25,
        );
        p.is_estimate = [true; 9];
        p.is_estimate[1] = false; // fy fixed
        p.is_estimate[4] = false; // alpha fixed

        let q = p.updated(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(q.f.x, 101.0);
        assert_eq!(q.f.y, 101.0);
        assert_eq!(q.c.x, 52.0);
        assert_eq!(q.alpha, 0.25);
        assert_eq!(q.c.y, 54.0);
        assert_eq!(q.k[0], 4.0);
        assert_eq!(q.k[3], 7.0);
    }

    #[test]
    fn assign_zeroes_unmasked_components_in_canonical_order() {
        let mut p = IntrinsicParams::new(
            Vector2::new(100.0, 101.0),
            Vector2::new(50.0, 51.0),
            Vector4::new(0.1, 0.2, 0.3, 0.4),
            0.25,
        );
        p.is_estimate = [true, true, true, true, false, true, false, false, false];

        p.assign(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        assert_eq!(p.f.x, 10.0);
        assert_eq!(p.f.y, 11.0);
        assert_eq!(p.c.x, 12.0);
        assert_eq!(p.c.y, 13.0);
        assert_eq!(p.alpha, 0.0);
        assert_eq!(p.k[0], 14.0);
        assert_eq!(p.k[1], 0.0);
    }
}
