use std::io::{BufRead, Write};
use std::path::Path;

use nalgebra::{Quaternion, Vector3};

use crate::{error::SlamError, transform::Transform};

/// A time-stamped pose sequence.
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    pub poses: Vec<Transform>,
    pub timestamps: Vec<f64>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pose: Transform, timestamp: f64) {
        self.poses.push(pose);
        self.timestamps.push(timestamp);
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn last(&self) -> Option<(&Transform, f64)> {
        let pose = self.poses.last()?;
        Some((pose, *self.timestamps.last().unwrap()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Transform, f64)> + '_ {
        self.poses
            .iter()
            .zip(self.timestamps.iter())
            .map(|(pose, time)| (pose, *time))
    }
}

/// Formats a timestamp with 17 significant digits, the fractional part
/// padded with zeros. `1000.0` becomes `1000.0000000000000`.
fn format_timestamp(timestamp: f64) -> String {
    let int_digits = (timestamp.abs().trunc() as u64).to_string().len();
    let decimals = 17usize.saturating_sub(int_digits);
    format!("{timestamp:.decimals$}")
}

/// Writes one trajectory line in Freiburg format:
/// `timestamp tx ty tz qx qy qz qw` (Hamilton quaternion, scalar last).
pub fn write_freiburg_line<W: Write>(
    out: &mut W,
    pose: &Transform,
    timestamp: f64,
) -> Result<(), SlamError> {
    let t = pose.translation();
    let q = pose.rotation().into_inner();
    writeln!(
        out,
        "{} {} {} {} {} {} {} {}",
        format_timestamp(timestamp),
        t[0],
        t[1],
        t[2],
        q.i,
        q.j,
        q.k,
        q.w
    )?;
    Ok(())
}

pub fn write_freiburg<W: Write>(out: &mut W, trajectory: &Trajectory) -> Result<(), SlamError> {
    for (pose, timestamp) in trajectory.iter() {
        write_freiburg_line(out, pose, timestamp)?;
    }
    Ok(())
}

/// Reads a Freiburg-format trajectory. Lines starting with `#` are skipped.
pub fn read_freiburg<P: AsRef<Path>>(path: P) -> Result<Trajectory, SlamError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    let mut trajectory = Trajectory::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens = line
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| SlamError::Parse(format!("bad trajectory token: {token}")))
            })
            .collect::<Result<Vec<f64>, SlamError>>()?;
        if tokens.len() != 8 {
            return Err(SlamError::Parse(format!(
                "expected 8 fields per trajectory line, got {}",
                tokens.len()
            )));
        }

        trajectory.push(
            Transform::new(
                &Vector3::new(tokens[1], tokens[2], tokens[3]),
                Quaternion::new(tokens[7], tokens[4], tokens[5], tokens[6]),
            ),
            tokens[0],
        );
    }
    Ok(trajectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use std::io::Write as _;

    #[test]
    fn test_timestamp_formatting() {
        assert_eq!(format_timestamp(1000.0), "1000.0000000000000");
        assert_eq!(format_timestamp(0.0), "0.0000000000000000");
        assert_eq!(format_timestamp(1305031102.5), "1305031102.5000000");
    }

    #[test]
    fn test_identity_line() {
        let mut buf = Vec::new();
        write_freiburg_line(&mut buf, &Transform::eye(), 1000.0).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "1000.0000000000000 0 0 0 0 0 0 1\n"
        );
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut trajectory = Trajectory::new();
        trajectory.push(Transform::eye(), 0.0);
        trajectory.push(
            Transform::from_parts(
                Vector3::new(0.25, -0.5, 1.75),
                UnitQuaternion::from_scaled_axis(Vector3::new(0.1, -0.2, 0.3)),
            ),
            1.0 / 30.0,
        );
        trajectory.push(
            Transform::from_parts(
                Vector3::new(-3.0, 2.0, 0.125),
                UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 1.5, 0.0)),
            ),
            2.0 / 30.0,
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.res");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            write_freiburg(&mut file, &trajectory).unwrap();
            file.flush().unwrap();
        }

        let read_back = read_freiburg(&path).unwrap();
        assert_eq!(read_back.len(), trajectory.len());
        for ((lfs, lt), (rfs, rt)) in trajectory.iter().zip(read_back.iter()) {
            assert!((lt - rt).abs() < 1e-9);
            assert!(lfs.error_to(rfs).norm() < 1e-6);
        }
    }

    #[test]
    fn test_reader_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gt.txt");
        std::fs::write(&path, "# ground truth\n# cols: t tx ty tz qx qy qz qw\n0.0 1 2 3 0 0 0 1\n")
            .unwrap();
        let trajectory = read_freiburg(&path).unwrap();
        assert_eq!(trajectory.len(), 1);
        assert_eq!(trajectory.poses[0].translation(), Vector3::new(1.0, 2.0, 3.0));
    }
}
