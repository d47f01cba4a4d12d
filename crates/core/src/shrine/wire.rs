//! SHRINE JSON shapes.
//!
//! Dates are Unix-epoch milliseconds. Nested `{"encodedClass": ...}` objects are modelled as
//! [`Encoded`] so their tags go through the closed decoders in [`super::tags`].

use super::tags::{
    ConjunctionComparison, ConstraintOperator, ContentsType, Occurrence, PossibilityKind,
    QueryOutput, QueryStatus, QueryType, ResultStatus, TimeUnit,
};
use serde::{Deserialize, Serialize};

/// A bare `{"encodedClass": tag}` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encoded<T> {
    pub encoded_class: T,
}

impl<T> Encoded<T> {
    pub fn new(encoded_class: T) -> Self {
        Self { encoded_class }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfoDto {
    pub protocol_version: i32,
    pub shrine_version: String,
    pub item_version: i32,
    pub create_date: i64,
    pub change_date: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShrineQueryDto {
    pub id: i64,
    pub version_info: VersionInfoDto,
    pub query_definition: QueryDefinitionDto,
    pub output: Encoded<QueryOutput>,
    pub status: Encoded<QueryStatus>,
    pub query_name: String,
    #[serde(default)]
    pub node_of_origin_id: i64,
    #[serde(default)]
    pub researcher_id: i64,
    #[serde(default)]
    pub topic_id: i32,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub flagged_message: Option<String>,
    pub encoded_class: QueryType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinitionDto {
    pub expression: ConjunctionDto,
}

/// Top-level conjunction of concept groups and timelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConjunctionDto {
    pub n_must_be_true: u32,
    pub compare: Encoded<ConjunctionComparison>,
    pub possibilities: Vec<PossibilityDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptConjunctionDto {
    pub n_must_be_true: u32,
    pub compare: Encoded<ConjunctionComparison>,
    pub possibilities: Vec<ConceptDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptGroupDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    #[serde(default = "default_occurs_at_least")]
    pub occurs_at_least: u32,
    pub concepts: ConceptConjunctionDto,
}

fn default_occurs_at_least() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    pub first: ConceptGroupDto,
    pub subsequent: Vec<SubsequentEventDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsequentEventDto {
    pub concept_group: ConceptGroupDto,
    pub previous_occurrence: Occurrence,
    pub this_occurrence: Occurrence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_constraint: Option<TimeConstraintDto>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeConstraintDto {
    pub operator: ConstraintOperator,
    pub value: u32,
    pub time_unit: TimeUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptDto {
    pub display_name: String,
    pub term_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<ConstraintDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDto {
    pub operator: ConstraintOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// A member of the top-level conjunction, discriminated by its `encodedClass`.
#[derive(Debug, Clone, PartialEq)]
pub enum PossibilityDto {
    ConceptGroup(ConceptGroupDto),
    Timeline(TimelineDto),
}

impl PossibilityDto {
    pub fn kind(&self) -> PossibilityKind {
        match self {
            PossibilityDto::ConceptGroup(_) => PossibilityKind::ConceptGroup,
            PossibilityDto::Timeline(_) => PossibilityKind::Timeline,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Tagged<'a, T> {
    encoded_class: PossibilityKind,
    #[serde(flatten)]
    inner: &'a T,
}

impl Serialize for PossibilityDto {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded_class = self.kind();
        match self {
            PossibilityDto::ConceptGroup(inner) => Tagged {
                encoded_class,
                inner,
            }
            .serialize(serializer),
            PossibilityDto::Timeline(inner) => Tagged {
                encoded_class,
                inner,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PossibilityDto {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let mut value = serde_json::Value::deserialize(deserializer)?;
        let tag = value
            .as_object_mut()
            .and_then(|object| object.remove("encodedClass"))
            .ok_or_else(|| D::Error::missing_field("encodedClass"))?;
        let tag = tag
            .as_str()
            .ok_or_else(|| D::Error::custom("encodedClass must be a string"))?;
        match PossibilityKind::parse(tag).map_err(D::Error::custom)? {
            PossibilityKind::ConceptGroup => serde_json::from_value(value)
                .map(PossibilityDto::ConceptGroup)
                .map_err(D::Error::custom),
            PossibilityKind::Timeline => serde_json::from_value(value)
                .map(PossibilityDto::Timeline)
                .map_err(D::Error::custom),
        }
    }
}

/// Obfuscation applied by a remote adapter. Passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscatingParametersDto {
    pub bin_size: i32,
    pub std_dev: f64,
    pub noise_clamp: i32,
    pub low_limit: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultProgressDto {
    pub id: i64,
    pub version_info: VersionInfoDto,
    pub query_id: i64,
    pub adapter_node_id: i64,
    pub adapter_node_name: String,
    pub status: Encoded<ResultStatus>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub crc_query_instance_id: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub obfuscating_parameters: Option<ObfuscatingParametersDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryForResultDto {
    pub query: ShrineQueryDto,
    #[serde(default)]
    pub node_id: Option<i64>,
    #[serde(default)]
    pub topic_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQueryAtQepDto {
    pub query_id: i64,
    pub query_status: Encoded<QueryStatus>,
    #[serde(default)]
    pub result_progresses: Vec<ResultProgressDto>,
}

/// Envelope exchanged with the hub. `contents` is itself JSON, typed by `contentsType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContentsDto {
    pub contents: String,
    pub contents_type: ContentsType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttemptIdDto {
    pub underlying: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttemptDto {
    pub delivery_attempt_id: DeliveryAttemptIdDto,
    pub millis_to_wait: Option<i64>,
    pub remaining_attempts: Option<i32>,
    pub contents: String,
}
