//! Byte entropy estimation for read and write buffers.

/// Shannon entropy of `data` in bits per byte, in `[0.0, 8.0]`.
pub fn shannon(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }

    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Running mean of per-operation entropy values.
pub fn running_mean(mean: f64, samples: u64, value: f64) -> f64 {
    (mean * samples as f64 + value) / (samples as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(shannon(&[]), 0.0);
    }

    #[test]
    fn test_constant_is_zero() {
        assert_eq!(shannon(&[7u8; 4096]), 0.0);
    }

    #[test]
    fn test_two_symbols_is_one_bit() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 2) as u8).collect();
        assert!((shannon(&data) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_bytes_is_eight_bits() {
        let data: Vec<u8> = (0..=255u8).cycle().take(256 * 16).collect();
        assert!((shannon(&data) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_running_mean() {
        let m = running_mean(0.0, 0, 4.0);
        assert_eq!(m, 4.0);
        let m = running_mean(m, 1, 8.0);
        assert_eq!(m, 6.0);
        let m = running_mean(m, 2, 0.0);
        assert!((m - 4.0).abs() < 1e-9);
    }
}
