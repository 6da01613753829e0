use nalgebra::{Matrix3, Vector3, Vector4};

use crate::rodrigues::rodrigues;

/// Pinhole part of the fisheye camera model: focal lengths, principal point
/// and skew. The skew `alpha` is defined so that `K[(0, 1)] == fx * alpha`.
#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub alpha: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            alpha: 0.0,
        }
    }

    pub fn with_skew(fx: f64, fy: f64, cx: f64, cy: f64, alpha: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            alpha,
        }
    }

    /// Identity camera: unit focals, zero principal point and skew. Useful
    /// for working directly in normalized camera coordinates.
    pub fn identity() -> Self {
        Self::new(1.0, 1.0, 0.0, 0.0)
    }

    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            alpha: k[(0, 1)] / k[(0, 0)],
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx,
            self.fx * self.alpha,
            self.cx,
            0.0,
            self.fy,
            self.cy,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// Four-coefficient equidistant distortion polynomial:
/// `theta_d = theta + k1*theta^3 + k2*theta^5 + k3*theta^7 + k4*theta^9`
/// with `theta = atan(r)` the angle of the incoming ray.
#[derive(Debug, Clone, Copy, Default)]
pub struct FisheyeDistortion {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
}

impl FisheyeDistortion {
    pub fn new(k1: f64, k2: f64, k3: f64, k4: f64) -> Self {
        Self { k1, k2, k3, k4 }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_vector(k: &Vector4<f64>) -> Self {
        Self {
            k1: k[0],
            k2: k[1],
            k3: k[2],
            k4: k[3],
        }
    }

    pub fn as_vector(&self) -> Vector4<f64> {
        Vector4::new(self.k1, self.k2, self.k3, self.k4)
    }

    /// Forward polynomial: ray angle to distorted angle.
    pub fn distort_angle(&self, theta: f64) -> f64 {
        let theta2 = theta * theta;
        let theta3 = theta2 * theta;
        let theta5 = theta3 * theta2;
        let theta7 = theta5 * theta2;
        let theta9 = theta7 * theta2;
        theta + self.k1 * theta3 + self.k2 * theta5 + self.k3 * theta7 + self.k4 * theta9
    }

    /// Inverse of [`distort_angle`](Self::distort_angle) by exactly ten
    /// fixed-point iterations. The iteration count is part of the contract:
    /// callers rely on bit-identical results across implementations.
    pub fn undistort_angle(&self, theta_d: f64) -> f64 {
        let mut theta = theta_d;
        for _ in 0..10 {
            let theta2 = theta * theta;
            let theta4 = theta2 * theta2;
            let theta6 = theta4 * theta2;
            let theta8 = theta6 * theta2;
            theta = theta_d
                / (1.0 + self.k1 * theta2 + self.k2 * theta4 + self.k3 * theta6 + self.k4 * theta8);
        }
        theta
    }

    /// Distort a normalized camera point. Near the optical axis
    /// (`r <= 1e-8`) the scale collapses to 1 so the output stays finite.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r = (x * x + y * y).sqrt();
        let theta = r.atan();
        let theta_d = self.distort_angle(theta);
        let cdist = if r > 1e-8 { theta_d / r } else { 1.0 };
        (x * cdist, y * cdist)
    }

    /// Undo [`apply`](Self::apply) on a normalized point via the fixed-point
    /// angle inversion.
    pub fn remove(&self, x: f64, y: f64) -> (f64, f64) {
        let theta_d = (x * x + y * y).sqrt();
        let scale = if theta_d > 1e-8 {
            let theta = self.undistort_angle(theta_d);
            theta.tan() / theta_d
        } else {
            1.0
        };
        (x * scale, y * scale)
    }
}

/// Rigid transform placing object space into camera space, with the rotation
/// kept in Rodrigues (axis * angle) form.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

impl Pose {
    pub fn new(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Self { rvec, tvec }
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        rodrigues(&self.rvec)
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * p + self.tvec
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            rvec: Vector3::zeros(),
            tvec: Vector3::zeros(),
        }
    }
}
