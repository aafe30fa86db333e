// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for the opaque byte fields carried in packet metadata.

/// Wraps a byte slice so that `Debug` prints at most `max_bytes` of hex dump,
/// with a note about anything elided. Codec-specific blobs and dependency
/// descriptors are small, but a hostile or buggy upstream could hand us
/// something large; debug output stays bounded either way.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (shown, elided) = if self.inner.len() > self.max_bytes {
            (&self.inner[..self.max_bytes], self.inner.len() - self.max_bytes)
        } else {
            (self.inner, 0)
        };
        write!(
            f,
            "[{} bytes] {}",
            self.inner.len(),
            pretty_hex::simple_hex(&shown)
        )?;
        if elided > 0 {
            write!(f, " ...{elided} more")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn short_input_is_complete() {
        let out = format!("{:?}", LimitedHex::new(&[0xab, 0xcd], 16));
        assert!(out.starts_with("[2 bytes]"), "{out}");
        assert!(out.contains("ab"), "{out}");
        assert!(!out.contains("more"), "{out}");
    }

    #[test]
    fn long_input_is_elided() {
        let data = [0u8; 100];
        let out = format!("{:?}", LimitedHex::new(&data, 16));
        assert!(out.starts_with("[100 bytes]"), "{out}");
        assert!(out.ends_with("...84 more"), "{out}");
    }
}
