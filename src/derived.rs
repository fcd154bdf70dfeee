//! Quantities derived on the ground-station side from raw FC state: ISA Mach number,
//! exponential-density dynamic pressure, and quaternion-to-Euler conversion. FC-direct mode
//! computes these locally; GS-relay mode receives them already computed upstream.

const GAMMA: f32 = 1.4;
const R_SPECIFIC: f32 = 287.05;
const SEA_LEVEL_TEMP_K: f32 = 288.15;
const LAPSE_RATE: f32 = 0.0065;
const TROPOPAUSE_ALT_M: f32 = 11_000.0;
const TROPOPAUSE_TEMP_K: f32 = 216.65;
const SEA_LEVEL_DENSITY: f32 = 1.225;
const SCALE_HEIGHT_M: f32 = 8500.0;

/// ISA temperature at altitude `h` (metres), clamping negative altitude to sea level.
fn isa_temperature(h: f32) -> f32 {
    let h = h.max(0.0);
    if h < TROPOPAUSE_ALT_M {
        SEA_LEVEL_TEMP_K - LAPSE_RATE * h
    } else {
        TROPOPAUSE_TEMP_K
    }
}

/// Speed of sound at altitude `h` (metres) under the International Standard Atmosphere.
pub fn speed_of_sound(h: f32) -> f32 {
    (GAMMA * R_SPECIFIC * isa_temperature(h)).sqrt()
}

/// Mach number for velocity `v` (m/s) at altitude `h` (metres).
pub fn mach(v: f32, h: f32) -> f32 {
    v.abs() / speed_of_sound(h)
}

/// Exponential-atmosphere air density at altitude `h` (metres), clamping negative altitude.
pub fn air_density(h: f32) -> f32 {
    SEA_LEVEL_DENSITY * (-h.max(0.0) / SCALE_HEIGHT_M).exp()
}

/// Dynamic pressure qbar = 1/2 * rho * v^2, in pascals.
pub fn dynamic_pressure(v: f32, h: f32) -> f32 {
    0.5 * air_density(h) * v * v
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Euler {
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
}

/// Quaternion `[w, x, y, z]` to aerospace ZYX Euler angles, in degrees.
/// Pitch is clamped to +/-90 degrees at the gimbal-lock boundary to avoid NaN from asin.
pub fn quaternion_to_euler(q: [f32; 4]) -> Euler {
    let [w, x, y, z] = q;

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch_arg = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0);
    let pitch = pitch_arg.asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    Euler {
        roll_deg: roll.to_degrees(),
        pitch_deg: pitch.to_degrees(),
        yaw_deg: yaw.to_degrees(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_of_sound_at_sea_level_matches_standard_value() {
        let a = speed_of_sound(0.0);
        assert!((a - 340.29).abs() < 0.5, "got {a}");
    }

    #[test]
    fn negative_altitude_clamps_to_sea_level() {
        assert_eq!(speed_of_sound(-500.0), speed_of_sound(0.0));
        assert_eq!(air_density(-500.0), air_density(0.0));
    }

    #[test]
    fn temperature_is_constant_above_tropopause() {
        let a1 = speed_of_sound(TROPOPAUSE_ALT_M);
        let a2 = speed_of_sound(TROPOPAUSE_ALT_M + 5000.0);
        assert_eq!(a1, a2);
    }

    #[test]
    fn mach_one_at_speed_of_sound() {
        let h = 1000.0;
        let a = speed_of_sound(h);
        assert!((mach(a, h) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn dynamic_pressure_zero_at_zero_velocity() {
        assert_eq!(dynamic_pressure(0.0, 1000.0), 0.0);
    }

    #[test]
    fn density_decreases_with_altitude() {
        assert!(air_density(10_000.0) < air_density(0.0));
    }

    #[test]
    fn identity_quaternion_is_zero_euler() {
        let e = quaternion_to_euler([1.0, 0.0, 0.0, 0.0]);
        assert!(e.roll_deg.abs() < 1e-4);
        assert!(e.pitch_deg.abs() < 1e-4);
        assert!(e.yaw_deg.abs() < 1e-4);
    }

    #[test]
    fn gimbal_lock_boundary_does_not_produce_nan() {
        // w*y - z*x = 0.5 exactly would be in-range; push past +/-1 to force the clamp.
        let q = [std::f32::consts::FRAC_1_SQRT_2, 0.0, std::f32::consts::FRAC_1_SQRT_2, 0.0];
        let e = quaternion_to_euler(q);
        assert!(!e.pitch_deg.is_nan());
        assert!((e.pitch_deg - 90.0).abs() < 0.1);
    }

    #[test]
    fn quarter_turn_about_yaw_axis() {
        let half = std::f32::consts::FRAC_PI_4;
        let q = [half.cos(), 0.0, 0.0, half.sin()];
        let e = quaternion_to_euler(q);
        assert!((e.yaw_deg - 90.0).abs() < 0.1);
        assert!(e.roll_deg.abs() < 0.1);
        assert!(e.pitch_deg.abs() < 0.1);
    }
}
