//! Wind pyramid.
//!
//! The wind direction is spread into four corner vectors tilted
//! `WIND_CONE_ANGLE_DEGREES` around it; the length-constraint kernel blends
//! them per strand so neighbouring strands do not sway in lockstep.

use crate::config::SimulationSettings;
use crate::constants::{WIND_CONE_ANGLE_DEGREES, WIND_STRAND_BUCKETS};
use glam::{Quat, Vec3, Vec4};

/// Wind strength pulses slowly with the simulation frame.
pub fn wind_magnitude(base: f32, frame: u32) -> f32 {
    let s = (frame as f32 * 0.01).sin();
    base * (s * s + 0.5)
}

/// Corner vectors `[+Y, -Y, +Z, -Z]` tilted around the wind direction.
/// `w` carries the frame the vectors were built for.
pub fn wind_pyramid(settings: &SimulationSettings, frame: u32) -> [Vec4; 4] {
    let direction = Vec3::from(settings.wind_direction).normalize_or_zero();
    let magnitude = wind_magnitude(settings.wind_magnitude, frame);
    if direction == Vec3::ZERO || magnitude == 0.0 {
        return [Vec4::new(0.0, 0.0, 0.0, frame as f32); 4];
    }

    let to_wind = Quat::from_rotation_arc(Vec3::X, direction);
    let angle = WIND_CONE_ANGLE_DEGREES.to_radians();
    [Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z].map(|axis| {
        let tilted = to_wind * (Quat::from_axis_angle(axis, angle) * Vec3::X);
        (tilted * magnitude).extend(frame as f32)
    })
}

/// The wind a strand sees, as blended by the length-constraint kernel.
pub fn strand_wind(corners: &[Vec4; 4], global_strand: u32) -> Vec3 {
    let a = (global_strand % WIND_STRAND_BUCKETS) as f32 / WIND_STRAND_BUCKETS as f32;
    a * corners[0].truncate()
        + (1.0 - a) * corners[1].truncate()
        + a * corners[2].truncate()
        + (1.0 - a) * corners[3].truncate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calm_settings_produce_no_wind() {
        let settings = SimulationSettings::default();
        let corners = wind_pyramid(&settings, 10);
        assert!(corners.iter().all(|c| c.truncate() == Vec3::ZERO));
    }

    #[test]
    fn corners_lean_into_the_wind() {
        let settings = SimulationSettings {
            wind_direction: [0.0, 0.0, 1.0],
            wind_magnitude: 2.0,
            ..Default::default()
        };
        let corners = wind_pyramid(&settings, 0);
        let expected = wind_magnitude(2.0, 0);
        for corner in corners {
            let v = corner.truncate();
            assert!((v.length() - expected).abs() < 1e-4);
            let cos = v.normalize().dot(Vec3::Z);
            assert!((cos - WIND_CONE_ANGLE_DEGREES.to_radians().cos()).abs() < 1e-4);
        }
    }

    #[test]
    fn blended_wind_points_downwind() {
        let settings = SimulationSettings {
            wind_direction: [1.0, 0.0, 0.0],
            wind_magnitude: 1.0,
            ..Default::default()
        };
        let corners = wind_pyramid(&settings, 3);
        for strand in [0, 7, 19, 20] {
            assert!(strand_wind(&corners, strand).x > 0.0);
        }
    }
}
