//! KITTI odometry trajectory text format: per frame the top three rows of
//! the 4×4 global pose, row-major, whitespace-separated.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use vo_geometry::Se3;

use crate::{Error, Result};

/// Format one pose as a KITTI line. Uses shortest-exact float formatting so
/// a write/parse round trip reproduces the matrix bit-for-bit.
pub fn format_pose(pose: &Se3) -> String {
    let r = &pose.r;
    let t = &pose.t;
    format!(
        "{} {} {} {} {} {} {} {} {} {} {} {}",
        r[(0, 0)],
        r[(0, 1)],
        r[(0, 2)],
        t[0],
        r[(1, 0)],
        r[(1, 1)],
        r[(1, 2)],
        t[1],
        r[(2, 0)],
        r[(2, 1)],
        r[(2, 2)],
        t[2]
    )
}

pub fn parse_pose(line: &str) -> Result<Se3> {
    let values: Vec<f64> = line
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|e| Error::Dataset(format!("bad pose value {tok:?}: {e}")))
        })
        .collect::<Result<_>>()?;
    if values.len() != 12 {
        return Err(Error::Dataset(format!(
            "pose line has {} values, expected 12",
            values.len()
        )));
    }
    let r = Matrix3::new(
        values[0], values[1], values[2], values[4], values[5], values[6], values[8], values[9],
        values[10],
    );
    let t = Vector3::new(values[3], values[7], values[11]);
    Ok(Se3::new(r, t))
}

/// Write global poses in ascending frame-id order.
pub fn save_kitti(path: &Path, poses: &BTreeMap<i64, Se3>) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut out = BufWriter::new(file);
    for pose in poses.values() {
        writeln!(out, "{}", format_pose(pose))?;
    }
    out.flush()?;
    Ok(())
}

/// Parse a KITTI pose file; line index is the frame id.
pub fn load_kitti(path: &Path) -> Result<Vec<Se3>> {
    let file = std::fs::File::open(path)?;
    let mut poses = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        poses.push(parse_pose(&line)?);
    }
    Ok(poses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    #[test]
    fn format_parse_round_trip_is_exact() {
        let pose = Se3::new(
            Rotation3::from_euler_angles(0.123456789, -0.987654321, 0.5).into_inner(),
            Vector3::new(1.0 / 3.0, -2.5e-7, 1234.5678),
        );
        let back = parse_pose(&format_pose(&pose)).unwrap();
        assert!((back.r - pose.r).norm() < 1e-9);
        assert!((back.t - pose.t).norm() < 1e-9);
        // Shortest-exact formatting makes the round trip lossless.
        assert_eq!(back.r, pose.r);
        assert_eq!(back.t, pose.t);
    }

    #[test]
    fn identity_line_matches_kitti_layout() {
        let line = format_pose(&Se3::identity());
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[0], "1");
        assert_eq!(fields[3], "0");
        assert_eq!(fields[5], "1");
        assert_eq!(fields[10], "1");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_pose("1 2 3").is_err());
        assert!(parse_pose("a b c d e f g h i j k l").is_err());
    }

    #[test]
    fn file_round_trip_preserves_order() {
        let mut poses = BTreeMap::new();
        for id in 0..5i64 {
            poses.insert(
                id,
                Se3::new(Matrix3::identity(), Vector3::new(id as f64, 0.0, 0.0)),
            );
        }
        let path = std::env::temp_dir().join("vo_core_traj_test.txt");
        save_kitti(&path, &poses).unwrap();
        let loaded = load_kitti(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.len(), 5);
        for (id, pose) in loaded.iter().enumerate() {
            assert_eq!(pose.t.x, id as f64);
        }
    }
}
