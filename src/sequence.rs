use std::fmt::{Display, Formatter};

/// The position of a posted receive in its connection's receive order. Sequence numbers are
///  handed out when a receive is *posted*, so they reflect post order regardless of the order
///  in which completions are delivered.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Sequence(u64);

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Sequence {
        Sequence(
            self.0.checked_add(1)
                .expect("sequence numbers are u64 and can not realistically overflow")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next() {
        assert_eq!(Sequence::ZERO.next(), Sequence::from_raw(1));
        assert_eq!(Sequence::from_raw(41).next().to_raw(), 42);
    }

    #[test]
    fn test_ordering() {
        assert!(Sequence::from_raw(3) < Sequence::from_raw(4));
        assert_eq!(Sequence::default(), Sequence::ZERO);
        assert_eq!(Sequence::from_raw(7).to_string(), "7");
    }
}
