use nalgebra::Vector3;

/// Returns the angle between two viewing rays in radians.
///
/// Neither ray needs to be normalized.
pub fn angle_between_rays(lfs: &Vector3<f64>, rfs: &Vector3<f64>) -> f64 {
    let denom = lfs.norm() * rfs.norm();
    if denom <= f64::EPSILON {
        return std::f64::consts::PI;
    }
    (lfs.dot(rfs) / denom).clamp(-1.0, 1.0).acos().abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_angle_between_rays() {
        let a = Vector3::new(0.0, 0.0, 2.0);
        let b = Vector3::new(0.0, 3.0, 0.0);
        assert_relative_eq!(
            angle_between_rays(&a, &b),
            std::f64::consts::FRAC_PI_2,
            epsilon = 1e-12
        );
        assert_relative_eq!(angle_between_rays(&a, &a), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_degenerate_ray_is_worst_case() {
        let zero = Vector3::zeros();
        let b = Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(angle_between_rays(&zero, &b), std::f64::consts::PI);
    }
}
