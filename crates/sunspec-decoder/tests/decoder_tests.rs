use sunspec_decoder::{apply_polarity, decode, to_signed, DecodeError, READING_FLOOR};
use types::Polarity;

fn approx_eq(left: f64, right: f64) -> bool {
    (left - right).abs() < 1e-9
}

#[test]
fn unscaled_power_is_published_as_is() {
    let value = decode(2500, None, true, Polarity::Positive).expect("decode");
    assert!(approx_eq(value, 2500.0));
}

#[test]
fn negative_scale_factor_shifts_decimal_point() {
    // 65534 is -2 as i16
    let value = decode(2500, Some(65534), true, Polarity::Positive).expect("decode");
    assert!(approx_eq(value, 25.0));
}

#[test]
fn positive_scale_factor_multiplies() {
    let value = decode(12, Some(3), true, Polarity::Positive).expect("decode");
    assert!(approx_eq(value, 12_000.0));
}

#[test]
fn zero_power_with_zero_scale_is_floored_not_invalid() {
    let value = decode(0, Some(0), true, Polarity::Positive).expect("decode");
    assert_eq!(value, READING_FLOOR);
}

#[test]
fn zero_scale_with_nonzero_power_is_inconsistent() {
    for power in [1u16, 50, 2500, 32_768, u16::MAX] {
        let result = decode(power, Some(0), true, Polarity::Positive);
        assert!(
            matches!(result, Err(DecodeError::Inconsistent { .. })),
            "power {power} should be inconsistent"
        );
    }

    assert_eq!(
        decode(50, Some(0), false, Polarity::Negative),
        Err(DecodeError::Inconsistent { power: 50 })
    );
}

#[test]
fn signed_power_reinterprets_high_values() {
    assert_eq!(to_signed(32_768), -32_768);
    assert_eq!(to_signed(65_535), -1);
    assert_eq!(to_signed(32_767), 32_767);

    // 65036 is -500 as i16; negated by a negative-polarity meter
    let value = decode(65_036, None, false, Polarity::Negative).expect("decode");
    assert!(approx_eq(value, 500.0));
}

#[test]
fn unsigned_power_keeps_high_values() {
    let value = decode(40_000, None, true, Polarity::Positive).expect("decode");
    assert!(approx_eq(value, 40_000.0));
}

#[test]
fn positive_polarity_floors_negative_results() {
    let value = decode(65_036, Some(65_535), false, Polarity::Positive).expect("decode");
    assert_eq!(value, READING_FLOOR);
}

#[test]
fn negative_polarity_negates_and_keeps_floor_sign() {
    let value = decode(100, None, true, Polarity::Negative).expect("decode");
    assert!(approx_eq(value, -100.0));

    let value = decode(0, None, true, Polarity::Negative).expect("decode");
    assert_eq!(value, -READING_FLOOR);
}

#[test]
fn tiny_scaled_values_are_floored() {
    // 1 * 10^-6 is below the floor
    let value = decode(1, Some(to_u16(-6)), true, Polarity::Positive).expect("decode");
    assert_eq!(value, READING_FLOOR);

    let value = decode(1, Some(to_u16(-6)), true, Polarity::Negative).expect("decode");
    assert_eq!(value, -READING_FLOOR);
}

#[test]
fn overflowing_scale_factor_is_rejected() {
    assert_eq!(
        decode(1, Some(i16::MAX as u16), true, Polarity::Positive),
        Err(DecodeError::OutOfRange {
            scale_factor: i16::MAX
        })
    );
    let value = decode(0, Some(i16::MAX as u16), true, Polarity::Positive).expect("decode");
    assert_eq!(value, READING_FLOOR);
}

#[test]
fn floor_applies_to_any_unsigned_input() {
    for power in [0u16, 1, 9, 100, 4_321, u16::MAX] {
        for sf in [-4i16, -2, -1, 1, 2] {
            let value = decode(power, Some(to_u16(sf)), true, Polarity::Positive).expect("decode");
            let expected = (f64::from(power) * 10f64.powi(i32::from(sf))).max(READING_FLOOR);
            assert!(approx_eq(value, expected), "power {power} sf {sf}");
        }
    }
}

#[test]
fn apply_polarity_preserves_large_magnitudes() {
    assert!(approx_eq(apply_polarity(-42.5, Polarity::Negative), 42.5));
    assert!(approx_eq(apply_polarity(42.5, Polarity::Positive), 42.5));
}

#[test]
fn negative_polarity_keeps_sign_of_tiny_negated_values() {
    // -5 * 10^-5 negates to +0.00005, which floors upward, not to -FLOOR
    let value = decode(65_531, Some(65_531), false, Polarity::Negative).expect("decode");
    assert_eq!(value, READING_FLOOR);

    assert_eq!(apply_polarity(-0.00005, Polarity::Negative), READING_FLOOR);
    assert_eq!(apply_polarity(0.00005, Polarity::Negative), -READING_FLOOR);
    assert_eq!(apply_polarity(0.0, Polarity::Negative), -READING_FLOOR);
}

fn to_u16(value: i16) -> u16 {
    value as u16
}
