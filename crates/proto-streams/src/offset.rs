/// Offset is a byte position within a stream's log, and is the resumption
/// token of a reader. Offsets of records within a stream strictly increase
/// in append order and are never reused.
///
/// Offsets are rendered as zero-padded decimal strings so that their lexical
/// and numeric orderings agree. Clients should treat them as opaque.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u64);

#[derive(Debug, thiserror::Error)]
#[error("invalid stream offset '{0}'")]
pub struct OffsetError(String);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Offset which is `len` bytes beyond this one.
    pub const fn advance(&self, len: u64) -> Self {
        Self(self.0 + len)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

impl std::str::FromStr for Offset {
    type Err = OffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(OffsetError(s.to_string()));
        }
        s.parse::<u64>()
            .map(Offset)
            .map_err(|_| OffsetError(s.to_string()))
    }
}

impl serde::Serialize for Offset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Offset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::Offset;

    #[test]
    fn test_offset_text_form() {
        assert_eq!(Offset::new(42).to_string(), "00000000000000000042");
        assert_eq!("42".parse::<Offset>().unwrap(), Offset::new(42));
        assert_eq!(
            "00000000000000000042".parse::<Offset>().unwrap(),
            Offset::new(42)
        );
        assert_eq!(
            u64::MAX.to_string().parse::<Offset>().unwrap().get(),
            u64::MAX
        );

        for bad in ["", "-1", "4a", " 1", "18446744073709551616"] {
            assert!(bad.parse::<Offset>().is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn test_lexical_order_matches_numeric() {
        let mut offsets: Vec<Offset> = [900, 3, 10_000, 77, 0].map(Offset::new).to_vec();
        let mut rendered: Vec<String> = offsets.iter().map(ToString::to_string).collect();

        offsets.sort();
        rendered.sort();

        let parsed: Vec<Offset> = rendered.iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(offsets, parsed);
    }
}
