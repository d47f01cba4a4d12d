//! Closed `encodedClass` tags.
//!
//! SHRINE names types and states with free-text `encodedClass` strings. Each tag set decodes
//! case-insensitively into a closed enum; anything outside the set is a decode error, except
//! [`ResultStatus`], which falls back to [`ResultStatus::Unknown`].

use super::ShrineError;
use crate::model::{DateUnit, NumericFilterType};

macro_rules! closed_tag {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $tag:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const TAGS: &'static [&'static str] = &[$($tag),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }

            /// Decode a tag, ignoring ASCII case.
            ///
            /// # Errors
            ///
            /// Returns `ShrineError::UnknownTag` for anything outside [`Self::TAGS`].
            pub fn parse(raw: &str) -> Result<Self, ShrineError> {
                let trimmed = raw.trim();
                $(
                    if trimmed.eq_ignore_ascii_case($tag) {
                        return Ok($name::$variant);
                    }
                )+
                Err(ShrineError::UnknownTag {
                    kind: stringify!($name),
                    tag: raw.to_owned(),
                })
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

macro_rules! strict_deserialize {
    ($($name:ident),+) => {
        $(
            impl<'de> serde::Deserialize<'de> for $name {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    let raw = String::deserialize(deserializer)?;
                    $name::parse(&raw).map_err(serde::de::Error::custom)
                }
            }
        )+
    };
}

closed_tag!(
    /// How many members of a conjunction must hold.
    ConjunctionComparison {
        AtLeast => "AtLeast",
        AtMost => "AtMost",
        Exactly => "Exactly",
    }
);

closed_tag!(
    /// Lifecycle of a query as seen by the hub.
    QueryStatus {
        SentToHub => "SentToHub",
        ReceivedByHub => "ReceivedByHub",
        IdAssigned => "IdAssigned",
        SentToAdapters => "SentToAdapters",
        Complete => "Complete",
        Error => "Error",
    }
);

closed_tag!(
    /// Progress of one adapter's result.
    ResultStatus {
        IdAssigned => "IdAssigned",
        ReceivedByAdapter => "ReceivedByAdapter",
        SubmittedToCrc => "SubmittedToCRC",
        ResultFromCrc => "ResultFromCRC",
        ErrorFromCrc => "ErrorFromCRC",
        ErrorInShrine => "ErrorInShrine",
        Unknown => "Unknown",
    }
);

closed_tag!(
    QueryOutput {
        Count => "Count",
    }
);

closed_tag!(
    QueryType {
        Query => "Query",
    }
);

closed_tag!(
    /// Kind of a top-level conjunction member.
    PossibilityKind {
        ConceptGroup => "ConceptGroup",
        Timeline => "Timeline",
    }
);

closed_tag!(
    /// Which occurrence of a timeline event is used for sequencing.
    Occurrence {
        First => "First",
        Any => "Any",
    }
);

closed_tag!(
    /// Kind of payload carried in a hub delivery envelope.
    ContentsType {
        UpdateQueryAtQep => "UpdateQueryAtQep",
        RunQueryForResult => "RunQueryForResult",
        Result => "Result",
    }
);

closed_tag!(
    ConstraintOperator {
        GreaterThan => "GreaterThan",
        GreaterThanOrEqual => "GreaterThanOrEqual",
        LessThan => "LessThan",
        LessThanOrEqual => "LessThanOrEqual",
        EqualTo => "EqualTo",
        Between => "Between",
    }
);

closed_tag!(
    TimeUnit {
        Minute => "Minute",
        Hour => "Hour",
        Day => "Day",
        Week => "Week",
        Month => "Month",
        Year => "Year",
    }
);

strict_deserialize!(
    ConjunctionComparison,
    QueryStatus,
    QueryOutput,
    QueryType,
    PossibilityKind,
    Occurrence,
    ContentsType,
    ConstraintOperator,
    TimeUnit
);

impl ResultStatus {
    /// Decode a status, mapping anything unrecognised to [`ResultStatus::Unknown`].
    pub fn parse_lenient(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(ResultStatus::Unknown)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResultStatus::ResultFromCrc | ResultStatus::ErrorFromCrc | ResultStatus::ErrorInShrine
        )
    }
}

impl Default for ResultStatus {
    fn default() -> Self {
        ResultStatus::Unknown
    }
}

impl<'de> serde::Deserialize<'de> for ResultStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let status = ResultStatus::parse_lenient(&raw);
        if status == ResultStatus::Unknown && !raw.trim().eq_ignore_ascii_case("Unknown") {
            tracing::warn!(tag = %raw, "unrecognised SHRINE result status");
        }
        Ok(status)
    }
}

impl From<NumericFilterType> for ConstraintOperator {
    fn from(value: NumericFilterType) -> Self {
        match value {
            NumericFilterType::GreaterThan => ConstraintOperator::GreaterThan,
            NumericFilterType::GreaterThanOrEqual => ConstraintOperator::GreaterThanOrEqual,
            NumericFilterType::LessThan => ConstraintOperator::LessThan,
            NumericFilterType::LessThanOrEqual => ConstraintOperator::LessThanOrEqual,
            NumericFilterType::EqualTo => ConstraintOperator::EqualTo,
            NumericFilterType::Between => ConstraintOperator::Between,
        }
    }
}

impl From<ConstraintOperator> for NumericFilterType {
    fn from(value: ConstraintOperator) -> Self {
        match value {
            ConstraintOperator::GreaterThan => NumericFilterType::GreaterThan,
            ConstraintOperator::GreaterThanOrEqual => NumericFilterType::GreaterThanOrEqual,
            ConstraintOperator::LessThan => NumericFilterType::LessThan,
            ConstraintOperator::LessThanOrEqual => NumericFilterType::LessThanOrEqual,
            ConstraintOperator::EqualTo => NumericFilterType::EqualTo,
            ConstraintOperator::Between => NumericFilterType::Between,
        }
    }
}

impl From<DateUnit> for TimeUnit {
    fn from(value: DateUnit) -> Self {
        match value {
            DateUnit::Minute => TimeUnit::Minute,
            DateUnit::Hour => TimeUnit::Hour,
            DateUnit::Day => TimeUnit::Day,
            DateUnit::Week => TimeUnit::Week,
            DateUnit::Month => TimeUnit::Month,
            DateUnit::Year => TimeUnit::Year,
        }
    }
}

impl From<TimeUnit> for DateUnit {
    fn from(value: TimeUnit) -> Self {
        match value {
            TimeUnit::Minute => DateUnit::Minute,
            TimeUnit::Hour => DateUnit::Hour,
            TimeUnit::Day => DateUnit::Day,
            TimeUnit::Week => DateUnit::Week,
            TimeUnit::Month => DateUnit::Month,
            TimeUnit::Year => DateUnit::Year,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_decode_case_insensitively() {
        assert_eq!(
            ConjunctionComparison::parse("atleast").expect("should decode"),
            ConjunctionComparison::AtLeast
        );
        assert_eq!(
            ResultStatus::parse(" resultfromcrc ").expect("should decode"),
            ResultStatus::ResultFromCrc
        );
        let kind: ContentsType =
            serde_json::from_str("\"RUNQUERYFORRESULT\"").expect("should deserialise");
        assert_eq!(kind, ContentsType::RunQueryForResult);
    }

    #[test]
    fn test_unknown_tag_fails_loudly() {
        let err = ConjunctionComparison::parse("Sometimes").expect_err("should reject");
        assert!(matches!(
            err,
            ShrineError::UnknownTag {
                kind: "ConjunctionComparison",
                ..
            }
        ));
        assert!(serde_json::from_str::<ContentsType>("\"Ping\"").is_err());
        assert!(serde_json::from_str::<Occurrence>("\"Last\"").is_err());
    }

    #[test]
    fn test_result_status_defaults_to_unknown() {
        let status: ResultStatus =
            serde_json::from_str("\"QueuedSomewhereNew\"").expect("should not fail");
        assert_eq!(status, ResultStatus::Unknown);
        assert_eq!(ResultStatus::default(), ResultStatus::Unknown);
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_tags_serialise_canonical_spelling() {
        let json = serde_json::to_string(&ResultStatus::SubmittedToCrc).expect("should serialise");
        assert_eq!(json, "\"SubmittedToCRC\"");
    }
}
