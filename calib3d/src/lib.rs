pub type CalibError = fisheye_core::Error;
pub type Result<T> = fisheye_core::Result<T>;

pub mod project;
pub use project::{project_points, project_points_with_jacobian, JACOBIAN_COLS};

pub mod distortion;
pub use distortion::{
    distort_points, init_undistort_rectify_map, init_undistort_rectify_map_fixed, undistort_points,
    FixedPointMaps, RotationSpec, INTER_BITS, INTER_TAB_SIZE,
};

pub mod homography;
pub use homography::compute_homography;

pub mod params;
pub use params::IntrinsicParams;

pub mod extrinsics;
pub use extrinsics::{calibrate_extrinsics, init_extrinsics, refine_extrinsics};

pub mod calibration;
pub use calibration::{calibrate, CalibrationFlags, CalibrationReport, TermCriteria};

pub mod stereo;
pub use stereo::{stereo_calibrate, StereoCalibrationFlags, StereoCalibrationReport};

pub mod rectify;
pub use rectify::{
    estimate_new_camera_matrix_for_undistort_rectify, stereo_rectify, BoundarySampling,
    NewCameraMatrixOptions, StereoRectification,
};
