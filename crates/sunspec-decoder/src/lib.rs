use thiserror::Error;
use types::Polarity;

/// Smallest magnitude ever handed to a consumer. Light-level style consumers
/// reject zero, so readings are clamped away from it.
pub const READING_FLOOR: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum DecodeError {
    /// The device answered with a zero scale factor next to a non-zero power
    /// value, which happens when the read straddles a register update.
    #[error("inconsistent snapshot: power {power} with scale factor 0")]
    Inconsistent { power: i32 },
    #[error("scale factor {scale_factor} overflows the reading")]
    OutOfRange { scale_factor: i16 },
}

/// Reinterprets a raw register as a two's-complement i16.
pub fn to_signed(raw: u16) -> i16 {
    raw as i16
}

/// Converts a raw power register and optional scale-factor register into a
/// published reading.
///
/// The power register is read as u16 when `unsigned` is set and as i16
/// otherwise; the scale factor is always i16. The scaled value is then signed
/// according to `polarity` and clamped so its magnitude is at least
/// [`READING_FLOOR`]:
///
/// * `Positive`: `max(value, READING_FLOOR)`, negative results collapse to the floor.
/// * `Negative`: the value is negated and keeps its sign, with magnitudes
///   below the floor reported as `READING_FLOOR` of the same sign. Zero is
///   reported as `-READING_FLOOR`.
pub fn decode(
    raw_power: u16,
    raw_scale_factor: Option<u16>,
    unsigned: bool,
    polarity: Polarity,
) -> Result<f64, DecodeError> {
    let power = if unsigned {
        i32::from(raw_power)
    } else {
        i32::from(to_signed(raw_power))
    };
    let scale_factor = raw_scale_factor.map(to_signed);

    let value = match scale_factor {
        Some(0) if power != 0 => return Err(DecodeError::Inconsistent { power }),
        Some(_) if power == 0 => 0.0,
        Some(sf) => {
            let scaled = f64::from(power) * 10f64.powi(i32::from(sf));
            if !scaled.is_finite() {
                return Err(DecodeError::OutOfRange { scale_factor: sf });
            }
            scaled
        }
        None => f64::from(power),
    };

    Ok(apply_polarity(value, polarity))
}

/// Applies the polarity sign and the magnitude floor to a scaled value.
pub fn apply_polarity(value: f64, polarity: Polarity) -> f64 {
    match polarity {
        Polarity::Positive => value.max(READING_FLOOR),
        Polarity::Negative => {
            let negated = -value;
            if negated == 0.0 {
                -READING_FLOOR
            } else if negated.abs() < READING_FLOOR {
                READING_FLOOR.copysign(negated)
            } else {
                negated
            }
        }
    }
}
