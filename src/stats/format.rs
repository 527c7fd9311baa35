//! Human readable formatting of stat values

const SI_BYTES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
const IEC_BYTES: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
const SI_BITS: [&str; 6] = ["b/s", "Kb/s", "Mb/s", "Gb/s", "Tb/s", "Pb/s"];

/// Unit system for [`pretty_bytes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Si,
    Iec,
}

fn scale(mut val: f64, divisor: f64, units: &[&'static str]) -> Option<(f64, usize)> {
    if !val.is_finite() || val < 0.0 {
        return None;
    }
    let mut i = 0;
    while val >= divisor {
        val /= divisor;
        i += 1;
    }
    (i < units.len()).then_some((val, i))
}

/// `1536` -> `1.50KiB`; whole bytes are printed without decimals.
pub fn pretty_bytes(val: u64, prefix: Prefix) -> String {
    let (divisor, units) = match prefix {
        Prefix::Si => (1000.0, &SI_BYTES),
        Prefix::Iec => (1024.0, &IEC_BYTES),
    };
    match scale(val as f64, divisor, units) {
        Some((v, 0)) => format!("{}{}", v, units[0]),
        Some((v, i)) => format!("{:.2}{}", v, units[i]),
        None => "invalid".to_string(),
    }
}

/// `666666.7` -> `666.67Kb/s`
pub fn pretty_bits_per_second(val: f64) -> String {
    match scale(val, 1000.0, &SI_BITS) {
        Some((v, i)) => format!("{:.2}{}", v, SI_BITS[i]),
        None => "unknown".to_string(),
    }
}

/// Seconds in, milliseconds out: `0.0123` -> `12.30ms`
pub fn pretty_millis(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "unknown".to_string();
    }
    format!("{:.2}ms", seconds * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty_bytes() {
        assert_eq!(pretty_bytes(512, Prefix::Iec), "512B");
        assert_eq!(pretty_bytes(1536, Prefix::Iec), "1.50KiB");
        assert_eq!(pretty_bytes(1_500_000, Prefix::Si), "1.50MB");
    }

    #[test]
    fn test_pretty_bits() {
        assert_eq!(pretty_bits_per_second(0.0), "0.00b/s");
        assert_eq!(pretty_bits_per_second(666_666.67), "666.67Kb/s");
        assert_eq!(pretty_bits_per_second(2_500_000.0), "2.50Mb/s");
        assert_eq!(pretty_bits_per_second(f64::NAN), "unknown");
    }

    #[test]
    fn test_pretty_millis() {
        assert_eq!(pretty_millis(0.0123), "12.30ms");
        assert_eq!(pretty_millis(f64::INFINITY), "unknown");
    }
}
