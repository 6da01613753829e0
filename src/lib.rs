//! Fisheye (equidistant model) camera calibration and rectification.
//!
//! Umbrella crate: [`core`] holds the camera/distortion/pose types and the
//! Rodrigues machinery, [`calib3d`] the projection kernel, distortion maps
//! and the calibration, stereo and rectification solvers.
//!
//! The data-parallel routines (point projection, rectification-map
//! generation) run on Rayon's global thread pool; size it with
//! `rayon::ThreadPoolBuilder::build_global` before building large maps if
//! the default is not wanted.

pub use fisheye_calib3d as calib3d;
pub use fisheye_core as core;
