/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// The input was not a well-formed Leaf URN
    #[error("invalid Leaf URN: {0}")]
    InvalidUrn(String),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(NonEmptyText)` if the trimmed input is non-empty,
    /// or `Err(TextError::Empty)` if it's empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Namespace prefix shared by every Leaf URN.
pub const LEAF_URN_PREFIX: &str = "urn:leaf:";

/// The kind segment of a Leaf URN (`urn:leaf:{kind}:...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UrnKind {
    Concept,
    Query,
    Dataset,
    Import,
}

impl UrnKind {
    fn as_str(self) -> &'static str {
        match self {
            UrnKind::Concept => "concept",
            UrnKind::Query => "query",
            UrnKind::Dataset => "dataset",
            UrnKind::Import => "import",
        }
    }

    fn parse(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "concept" => Some(UrnKind::Concept),
            "query" => Some(UrnKind::Query),
            "dataset" => Some(UrnKind::Dataset),
            "import" => Some(UrnKind::Import),
            _ => None,
        }
    }
}

/// A stable, cross-instance identifier such as `urn:leaf:concept:diag:codeset=ICD9+code=123.42`.
///
/// The prefix and kind are matched case-insensitively; the value after the kind is kept
/// verbatim because it is the portable part shared between Leaf instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafUrn {
    kind: UrnKind,
    value: String,
}

impl LeafUrn {
    /// Parse a URN string.
    ///
    /// # Errors
    ///
    /// Returns `TextError::Empty` for blank input and `TextError::InvalidUrn` if the prefix,
    /// kind or value are missing.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, TextError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Err(TextError::Empty);
        }
        let prefix_len = LEAF_URN_PREFIX.len();
        let rest = match (raw.get(..prefix_len), raw.get(prefix_len..)) {
            (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case(LEAF_URN_PREFIX) => rest,
            _ => return Err(TextError::InvalidUrn(raw.to_owned())),
        };
        let (kind, value) = rest
            .split_once(':')
            .ok_or_else(|| TextError::InvalidUrn(raw.to_owned()))?;
        let kind = UrnKind::parse(kind).ok_or_else(|| TextError::InvalidUrn(raw.to_owned()))?;
        if value.trim().is_empty() {
            return Err(TextError::InvalidUrn(raw.to_owned()));
        }
        Ok(Self {
            kind,
            value: value.to_owned(),
        })
    }

    /// Build a concept URN from its value segment.
    pub fn concept(value: impl AsRef<str>) -> Result<Self, TextError> {
        Self::parse(format!("{}concept:{}", LEAF_URN_PREFIX, value.as_ref()))
    }

    pub fn kind(&self) -> UrnKind {
        self.kind
    }

    /// The portion after `urn:leaf:{kind}:`.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for LeafUrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:{}", LEAF_URN_PREFIX, self.kind.as_str(), self.value)
    }
}

impl std::str::FromStr for LeafUrn {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for LeafUrn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for LeafUrn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        LeafUrn::parse(&s).map_err(serde::de::Error::custom)
    }
}
