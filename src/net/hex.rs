//! Hex rendering of digests for logs and `Debug` output.

use core::fmt;

/// Borrowed bytes printed as hex without allocating. `{}` is lowercase,
/// `{:X}` uppercase.
#[derive(Clone, Copy)]
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{:02x}", b))
    }
}

impl fmt::UpperHex for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{:02X}", b))
    }
}

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub trait ToHex {
    fn hex(&self) -> Hex<'_>;
}

impl<T: ?Sized + AsRef<[u8]>> ToHex for T {
    fn hex(&self) -> Hex<'_> {
        Hex(self.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_every_byte() {
        let digest = [0x0a, 0xff, 0x00];
        assert_eq!(digest.hex().to_string(), "0aff00");
        assert_eq!(format!("{:X}", digest.hex()), "0AFF00");
    }
}
