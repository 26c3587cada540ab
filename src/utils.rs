use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

pub fn setup_logger(debug: bool) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(Some(tracing_subscriber::fmt::layer().with_filter(
            if debug {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            },
        )))
        .init();

    Ok(())
}

/// Round `x` down to a multiple of `step` (`step > 0`).
pub fn round_down(x: u64, step: u64) -> u64 {
    x - x % step
}

/// Round `x` up to a multiple of `step` (`step > 0`).
pub fn round_up(x: u64, step: u64) -> u64 {
    match x % step {
        0 => x,
        r => x + (step - r),
    }
}

pub fn parse_octal(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s, 8)
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn rounding() {
        assert_eq!(round_down(4095, 4096), 0);
        assert_eq!(round_down(4096, 4096), 4096);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(8192, 4096), 8192);
        assert_eq!(round_up(0, 4096), 0);
    }
    #[test]
    fn octal() {
        assert_eq!(parse_octal("644").unwrap(), 0o644);
        assert!(parse_octal("9").is_err());
    }
}
