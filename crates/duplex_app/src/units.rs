//! Sizes and counts with `dd`-style multiplicative suffixes.

const SUFFIXES: [(&str, u64); 10] = [
    ("KB", 1000),
    ("MB", 1000 * 1000),
    ("GB", 1000 * 1000 * 1000),
    ("TB", 1000 * 1000 * 1000 * 1000),
    ("PB", 1000 * 1000 * 1000 * 1000 * 1000),
    ("K", 1 << 10),
    ("M", 1 << 20),
    ("G", 1 << 30),
    ("T", 1 << 40),
    ("P", 1 << 50),
];

/// Parses `123`, `4K` (binary) or `4KB` (decimal).
pub fn parse_size(text: &str) -> Result<u64, String> {
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(digits_end);
    if digits.is_empty() {
        return Err(format!("'{text}' is not a number"));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("'{text}' is out of range"))?;

    let multiplier = if suffix.is_empty() {
        1
    } else {
        SUFFIXES
            .iter()
            .find(|(name, _)| *name == suffix)
            .map(|(_, value)| *value)
            .ok_or_else(|| format!("unknown suffix '{suffix}' in '{text}'"))?
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("'{text}' is out of range"))
}

/// [`parse_size`] for buffer sizes, which must be addressable and non-zero.
pub fn parse_block_size(text: &str) -> Result<usize, String> {
    let size = parse_size(text)?;
    if size == 0 {
        return Err("block size must be greater than 0".to_string());
    }
    usize::try_from(size).map_err(|_| format!("'{text}' is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("512"), Ok(512));
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("4KB"), Ok(4000));
        assert_eq!(parse_size("16M"), Ok(16 * 1024 * 1024));
        assert_eq!(parse_size("2GB"), Ok(2_000_000_000));
        assert_eq!(parse_size("1P"), Ok(1 << 50));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("K").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("12k").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("99999999P").is_err());
        assert!(parse_block_size("0").is_err());
    }
}
