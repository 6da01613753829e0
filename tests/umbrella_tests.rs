use fisheye::calib3d::{
    calibrate, init_undistort_rectify_map, project_points, CalibrationFlags, IntrinsicParams,
    TermCriteria,
};
use fisheye::core::{FisheyeDistortion, Pose};
use nalgebra::{Vector2, Vector3, Vector4};

#[test]
fn crate_roots_reexport_the_calibration_pipeline() {
    let truth = IntrinsicParams::new(
        Vector2::new(210.0, 208.0),
        Vector2::new(320.5, 239.0),
        Vector4::new(-0.01, 0.004, 0.0, 0.0),
        0.0,
    );
    let poses = [
        Pose::new(Vector3::new(0.1, -0.1, 0.03), Vector3::new(-0.2, -0.2, 1.2)),
        Pose::new(Vector3::new(-0.12, 0.16, -0.04), Vector3::new(0.14, -0.26, 1.5)),
        Pose::new(Vector3::new(0.26, 0.1, 0.06), Vector3::new(-0.36, 0.05, 1.3)),
        Pose::new(Vector3::new(-0.05, -0.2, 0.1), Vector3::new(0.0, 0.1, 1.7)),
    ];

    let mut object = Vec::new();
    for y in 0..6 {
        for x in 0..7 {
            object.push(Vector3::new(x as f64 * 0.1, y as f64 * 0.1, 0.0));
        }
    }

    let object_sets: Vec<_> = poses.iter().map(|_| object.clone()).collect();
    let image_sets: Vec<_> = poses
        .iter()
        .map(|p| project_points(&object, p, &truth.intrinsics(), &truth.distortion()))
        .collect();

    let report = calibrate(
        &object_sets,
        &image_sets,
        (640, 480),
        None,
        CalibrationFlags {
            fix_skew: true,
            fix_k3: true,
            fix_k4: true,
            ..Default::default()
        },
        TermCriteria::Both {
            max_count: 150,
            epsilon: 1e-13,
        },
    )
    .unwrap();

    assert!((report.params.f - truth.f).norm() < 1e-3);
    assert!(report.rms < 1e-4);

    let maps = init_undistort_rectify_map(
        &report.params.intrinsics(),
        &FisheyeDistortion::from_vector(&report.params.k),
        None,
        None,
        (64, 48),
    )
    .unwrap();
    assert_eq!(maps.0.len(), 64 * 48);
}
