//! Amplitude metering for the "on air" indicator.
//!
//! Levels are on a 0-255 scale: the mean absolute sample value of a block,
//! scaled so full-scale noise reads 255.

pub fn mean_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s.abs().min(1.0)).sum();
    sum / samples.len() as f32 * 255.0
}

pub fn mean_level_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples
        .iter()
        .map(|s| (*s as f32 / i16::MAX as f32).abs().min(1.0))
        .sum();
    sum / samples.len() as f32 * 255.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(mean_level(&[]), 0.0);
        assert_eq!(mean_level(&[0.0; 480]), 0.0);
        assert_eq!(mean_level_i16(&[0; 480]), 0.0);
    }

    #[test]
    fn test_full_scale() {
        let square: Vec<f32> = (0..480).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((mean_level(&square) - 255.0).abs() < 0.01);
        assert!((mean_level_i16(&[i16::MAX, -i16::MAX]) - 255.0).abs() < 0.01);
    }

    #[test]
    fn test_quiet_hiss_under_threshold() {
        // ~-50 dBFS noise floor stays below a level of 2
        let hiss: Vec<f32> = (0..960).map(|i| if i % 3 == 0 { 0.003 } else { -0.003 }).collect();
        assert!(mean_level(&hiss) < 2.0);
    }
}
