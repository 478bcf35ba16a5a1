/// StreamName is the validated, path-like name of a stream,
/// such as `conversations/c1/responses`.
///
/// Names are `/`-separated segments of `[A-Za-z0-9_.=-]`, where no segment
/// is empty, `.`, or `..`. The final segment may not be `append`, which
/// addresses a stream's append endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamName(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    #[error("stream name is empty")]
    Empty,
    #[error("stream name is longer than {} bytes", StreamName::MAX_LEN)]
    TooLong,
    #[error("stream name '{0}' has an empty or relative path segment")]
    BadSegment(String),
    #[error("stream name '{name}' has invalid character {ch:?}")]
    BadCharacter { name: String, ch: char },
    #[error("stream name '{0}' ends with the reserved segment 'append'")]
    Reserved(String),
}

impl StreamName {
    pub const MAX_LEN: usize = 120;

    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();

        if name.is_empty() {
            return Err(NameError::Empty);
        } else if name.len() > Self::MAX_LEN {
            return Err(NameError::TooLong);
        }
        if let Some(ch) = name
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '.' | '=' | '-')))
        {
            return Err(NameError::BadCharacter { name, ch });
        }
        if name
            .split('/')
            .any(|segment| matches!(segment, "" | "." | ".."))
        {
            return Err(NameError::BadSegment(name));
        }
        if name.rsplit('/').next() == Some(crate::APPEND_SEGMENT) {
            return Err(NameError::Reserved(name));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::ops::Deref for StreamName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for StreamName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for StreamName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StreamName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        StreamName::new(String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}
