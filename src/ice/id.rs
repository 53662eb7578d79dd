use std::fmt;
use std::str::from_utf8;

// deliberate subset of ice-char, etc that are "safe"
const CHARS: &[u8] = b"abcdefghijklmnopqrstuvxyzABCDEFGHIJKLMNOPQRSTUVXYZ0123456789";

/// Random string of ice-chars with fixed length.
pub struct Id<const L: usize>([u8; L]);

impl<const L: usize> Id<L> {
    pub fn random() -> Id<L> {
        let mut x = [0; L];
        for val in x.iter_mut() {
            *val = CHARS[fastrand::usize(..CHARS.len())];
        }
        Id(x)
    }
}

impl<const L: usize> fmt::Display for Id<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only ever filled from CHARS.
        let s = from_utf8(&self.0).map_err(|_| fmt::Error)?;
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_ids_are_ice_chars() {
        let s = Id::<22>::random().to_string();
        assert_eq!(s.len(), 22);
        assert!(s.bytes().all(|b| CHARS.contains(&b)));
    }
}
