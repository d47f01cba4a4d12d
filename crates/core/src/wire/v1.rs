//! Version 1 of the native JSON API.

use crate::federation::{FederatedCount, SiteResult, SiteStatus};
use crate::hashing;
use crate::model::{
    CountResponse, DateBound, DateBoundary, DateUnit, JoinSequence, NumericFilter,
    NumericFilterType, Panel, PanelFilter, PanelItem, PatientCount, QueryDefinition, QueryId,
    RecencyFilter, ResourceRef, SubPanel,
};
use crate::network::{NetworkEndpoint, NetworkEndpointDraft, NetworkIdentity, UpdateResult};
use crate::resolver::PreflightReport;
use crate::{LeafError, LeafResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_true() -> bool {
    true
}

fn default_minimum_count() -> u32 {
    1
}

// ==================== Query definition ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinitionDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<Uuid>,
    pub panels: Vec<PanelDto>,
    #[serde(default)]
    pub panel_filters: Vec<PanelFilterDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PanelDto {
    #[serde(default = "default_true")]
    pub include_panel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_filter: Option<DateBoundaryDto>,
    pub sub_panels: Vec<SubPanelDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SubPanelDto {
    #[serde(default = "default_true")]
    pub include_sub_panel: bool,
    #[serde(default = "default_minimum_count")]
    pub minimum_count: u32,
    #[serde(default)]
    pub join_sequence: JoinSequenceDto,
    pub panel_items: Vec<PanelItemDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PanelItemDto {
    /// Local id or `urn:leaf:concept:...`.
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_filter: Option<NumericFilterDto>,
    #[serde(default)]
    pub recency_filter: RecencyFilterDto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PanelFilterDto {
    pub resource: String,
    pub is_inclusion: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum NumericFilterTypeDto {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    EqualTo,
    Between,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NumericFilterDto {
    pub filter_type: NumericFilterTypeDto,
    pub filter: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum RecencyFilterDto {
    #[default]
    None,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum SequenceTypeDto {
    #[default]
    Encounter,
    Event,
    PlusMinus,
    WithinFollowing,
    AnytimeFollowing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum DateUnitDto {
    Minute,
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct JoinSequenceDto {
    #[serde(default)]
    pub sequence_type: SequenceTypeDto,
    #[serde(default)]
    pub increment: u32,
    #[serde(default)]
    pub date_increment_type: DateUnitDto,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "type")]
pub enum DateBoundDto {
    Now,
    Specific { date: DateTime<Utc> },
    Relative { unit: DateUnitDto, increment: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DateBoundaryDto {
    pub start: DateBoundDto,
    pub end: DateBoundDto,
}

impl From<DateUnitDto> for DateUnit {
    fn from(unit: DateUnitDto) -> Self {
        match unit {
            DateUnitDto::Minute => DateUnit::Minute,
            DateUnitDto::Hour => DateUnit::Hour,
            DateUnitDto::Day => DateUnit::Day,
            DateUnitDto::Week => DateUnit::Week,
            DateUnitDto::Month => DateUnit::Month,
            DateUnitDto::Year => DateUnit::Year,
        }
    }
}

impl From<DateUnit> for DateUnitDto {
    fn from(unit: DateUnit) -> Self {
        match unit {
            DateUnit::Minute => DateUnitDto::Minute,
            DateUnit::Hour => DateUnitDto::Hour,
            DateUnit::Day => DateUnitDto::Day,
            DateUnit::Week => DateUnitDto::Week,
            DateUnit::Month => DateUnitDto::Month,
            DateUnit::Year => DateUnitDto::Year,
        }
    }
}

impl From<NumericFilterTypeDto> for NumericFilterType {
    fn from(t: NumericFilterTypeDto) -> Self {
        match t {
            NumericFilterTypeDto::GreaterThan => NumericFilterType::GreaterThan,
            NumericFilterTypeDto::GreaterThanOrEqual => NumericFilterType::GreaterThanOrEqual,
            NumericFilterTypeDto::LessThan => NumericFilterType::LessThan,
            NumericFilterTypeDto::LessThanOrEqual => NumericFilterType::LessThanOrEqual,
            NumericFilterTypeDto::EqualTo => NumericFilterType::EqualTo,
            NumericFilterTypeDto::Between => NumericFilterType::Between,
        }
    }
}

impl From<NumericFilterType> for NumericFilterTypeDto {
    fn from(t: NumericFilterType) -> Self {
        match t {
            NumericFilterType::GreaterThan => NumericFilterTypeDto::GreaterThan,
            NumericFilterType::GreaterThanOrEqual => NumericFilterTypeDto::GreaterThanOrEqual,
            NumericFilterType::LessThan => NumericFilterTypeDto::LessThan,
            NumericFilterType::LessThanOrEqual => NumericFilterTypeDto::LessThanOrEqual,
            NumericFilterType::EqualTo => NumericFilterTypeDto::EqualTo,
            NumericFilterType::Between => NumericFilterTypeDto::Between,
        }
    }
}

impl From<RecencyFilterDto> for RecencyFilter {
    fn from(r: RecencyFilterDto) -> Self {
        match r {
            RecencyFilterDto::None => RecencyFilter::None,
            RecencyFilterDto::Min => RecencyFilter::Min,
            RecencyFilterDto::Max => RecencyFilter::Max,
        }
    }
}

impl From<RecencyFilter> for RecencyFilterDto {
    fn from(r: RecencyFilter) -> Self {
        match r {
            RecencyFilter::None => RecencyFilterDto::None,
            RecencyFilter::Min => RecencyFilterDto::Min,
            RecencyFilter::Max => RecencyFilterDto::Max,
        }
    }
}

impl From<JoinSequenceDto> for JoinSequence {
    fn from(dto: JoinSequenceDto) -> Self {
        let unit = DateUnit::from(dto.date_increment_type);
        match dto.sequence_type {
            SequenceTypeDto::Encounter => JoinSequence::Encounter,
            SequenceTypeDto::Event => JoinSequence::Event,
            SequenceTypeDto::PlusMinus => JoinSequence::PlusMinus {
                increment: dto.increment,
                unit,
            },
            SequenceTypeDto::WithinFollowing => JoinSequence::WithinFollowing {
                increment: dto.increment,
                unit,
            },
            SequenceTypeDto::AnytimeFollowing => JoinSequence::AnytimeFollowing,
        }
    }
}

impl From<JoinSequence> for JoinSequenceDto {
    fn from(join: JoinSequence) -> Self {
        let (sequence_type, increment, unit) = match join {
            JoinSequence::Encounter => (SequenceTypeDto::Encounter, 0, DateUnit::Day),
            JoinSequence::Event => (SequenceTypeDto::Event, 0, DateUnit::Day),
            JoinSequence::PlusMinus { increment, unit } => {
                (SequenceTypeDto::PlusMinus, increment, unit)
            }
            JoinSequence::WithinFollowing { increment, unit } => {
                (SequenceTypeDto::WithinFollowing, increment, unit)
            }
            JoinSequence::AnytimeFollowing => (SequenceTypeDto::AnytimeFollowing, 0, DateUnit::Day),
        };
        Self {
            sequence_type,
            increment,
            date_increment_type: unit.into(),
        }
    }
}

impl From<DateBoundDto> for DateBound {
    fn from(dto: DateBoundDto) -> Self {
        match dto {
            DateBoundDto::Now => DateBound::Now,
            DateBoundDto::Specific { date } => DateBound::Specific(date),
            DateBoundDto::Relative { unit, increment } => DateBound::Relative {
                unit: unit.into(),
                increment,
            },
        }
    }
}

impl From<DateBound> for DateBoundDto {
    fn from(bound: DateBound) -> Self {
        match bound {
            DateBound::Now => DateBoundDto::Now,
            DateBound::Specific(date) => DateBoundDto::Specific { date },
            DateBound::Relative { unit, increment } => DateBoundDto::Relative {
                unit: unit.into(),
                increment,
            },
        }
    }
}

fn parse_reference(raw: &str) -> LeafResult<ResourceRef> {
    ResourceRef::parse(raw)
        .map_err(|e| LeafError::InvalidInput(format!("resource '{}': {}", raw, e)))
}

impl TryFrom<QueryDefinitionDto> for QueryDefinition {
    type Error = LeafError;

    fn try_from(dto: QueryDefinitionDto) -> LeafResult<Self> {
        let panels = dto
            .panels
            .into_iter()
            .map(|panel| {
                let sub_panels = panel
                    .sub_panels
                    .into_iter()
                    .map(|sub| {
                        let items = sub
                            .panel_items
                            .into_iter()
                            .map(|item| {
                                let numeric_filter = item
                                    .numeric_filter
                                    .map(|f| NumericFilter::new(f.filter_type.into(), &f.filter))
                                    .transpose()?;
                                Ok(PanelItem {
                                    concept: parse_reference(&item.resource)?,
                                    numeric_filter,
                                    recency: item.recency_filter.into(),
                                })
                            })
                            .collect::<LeafResult<Vec<_>>>()?;
                        Ok(SubPanel {
                            include: sub.include_sub_panel,
                            minimum_count: sub.minimum_count,
                            join_sequence: sub.join_sequence.into(),
                            items,
                        })
                    })
                    .collect::<LeafResult<Vec<_>>>()?;
                Ok(Panel {
                    include: panel.include_panel,
                    date_boundary: panel.date_filter.map(|d| DateBoundary {
                        start: d.start.into(),
                        end: d.end.into(),
                    }),
                    sub_panels,
                })
            })
            .collect::<LeafResult<Vec<_>>>()?;

        let panel_filters = dto
            .panel_filters
            .into_iter()
            .map(|filter| {
                Ok(PanelFilter {
                    concept: parse_reference(&filter.resource)?,
                    is_inclusion: filter.is_inclusion,
                    is_active: filter.is_active,
                })
            })
            .collect::<LeafResult<Vec<_>>>()?;

        Ok(QueryDefinition {
            query_id: dto.query_id.map(QueryId::from_uuid),
            panels,
            panel_filters,
        })
    }
}

impl From<&QueryDefinition> for QueryDefinitionDto {
    fn from(definition: &QueryDefinition) -> Self {
        Self {
            query_id: definition.query_id.map(|id| *id.as_uuid()),
            panels: definition
                .panels
                .iter()
                .map(|panel| PanelDto {
                    include_panel: panel.include,
                    date_filter: panel.date_boundary.map(|d| DateBoundaryDto {
                        start: d.start.into(),
                        end: d.end.into(),
                    }),
                    sub_panels: panel
                        .sub_panels
                        .iter()
                        .map(|sub| SubPanelDto {
                            include_sub_panel: sub.include,
                            minimum_count: sub.minimum_count,
                            join_sequence: sub.join_sequence.into(),
                            panel_items: sub
                                .items
                                .iter()
                                .map(|item| PanelItemDto {
                                    resource: item.concept.to_string(),
                                    numeric_filter: item.numeric_filter.as_ref().map(|f| {
                                        NumericFilterDto {
                                            filter_type: f.filter_type().into(),
                                            filter: f.bounds().iter().copied().map(Some).collect(),
                                        }
                                    }),
                                    recency_filter: item.recency.into(),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
            panel_filters: definition
                .panel_filters
                .iter()
                .map(|f| PanelFilterDto {
                    resource: f.concept.to_string(),
                    is_inclusion: f.is_inclusion,
                    is_active: f.is_active,
                })
                .collect(),
        }
    }
}

/// Fingerprint of a definition's logic, ignoring its QueryId.
///
/// # Errors
/// Returns `LeafError::Serialization` if the definition cannot be encoded.
pub fn fingerprint(definition: &QueryDefinition) -> LeafResult<String> {
    let mut dto = QueryDefinitionDto::from(definition);
    dto.query_id = None;
    let canonical = serde_json::to_vec(&dto).map_err(LeafError::Serialization)?;
    Ok(hashing::versioned_hash([canonical]))
}

// ==================== Counts ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheckDto {
    pub resource: String,
    pub is_present: bool,
    pub is_authorized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PreflightDto {
    pub ok: bool,
    pub checks: Vec<PreflightCheckDto>,
}

impl From<&PreflightReport> for PreflightDto {
    fn from(report: &PreflightReport) -> Self {
        Self {
            ok: report.ok(),
            checks: report
                .checks
                .iter()
                .map(|c| PreflightCheckDto {
                    resource: c.reference.to_string(),
                    is_present: c.is_present,
                    is_authorized: c.is_authorized,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PatientCountDto {
    pub value: u64,
    pub plus_minus: u64,
    pub within_low_cell_threshold: bool,
    #[serde(default)]
    pub sql_statements: Vec<String>,
}

impl From<&PatientCount> for PatientCountDto {
    fn from(count: &PatientCount) -> Self {
        Self {
            value: count.value,
            plus_minus: count.plus_minus,
            within_low_cell_threshold: count.within_low_cell_threshold,
            sql_statements: count.sql_statements.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CountResponseDto {
    pub query_id: Uuid,
    pub cached: bool,
    pub preflight: PreflightDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PatientCountDto>,
}

impl From<&CountResponse> for CountResponseDto {
    fn from(response: &CountResponse) -> Self {
        Self {
            query_id: *response.query_id.as_uuid(),
            cached: response.cached(),
            preflight: PreflightDto::from(&response.preflight),
            result: response.result.as_ref().map(PatientCountDto::from),
        }
    }
}

// ==================== Federation ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum SiteStatusDto {
    Completed,
    TimedOut,
    Rejected,
    CertificateInvalid,
    CertificateMismatch,
    Unreachable,
    MalformedResponse,
}

impl From<SiteStatus> for SiteStatusDto {
    fn from(status: SiteStatus) -> Self {
        match status {
            SiteStatus::Completed => SiteStatusDto::Completed,
            SiteStatus::TimedOut => SiteStatusDto::TimedOut,
            SiteStatus::Rejected => SiteStatusDto::Rejected,
            SiteStatus::CertificateInvalid => SiteStatusDto::CertificateInvalid,
            SiteStatus::CertificateMismatch => SiteStatusDto::CertificateMismatch,
            SiteStatus::Unreachable => SiteStatusDto::Unreachable,
            SiteStatus::MalformedResponse => SiteStatusDto::MalformedResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SiteResultDto {
    pub endpoint_id: Uuid,
    pub name: String,
    pub status: SiteStatusDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within_low_cell_threshold: Option<bool>,
}

impl From<&SiteResult> for SiteResultDto {
    fn from(site: &SiteResult) -> Self {
        Self {
            endpoint_id: site.endpoint_id,
            name: site.name.clone(),
            status: site.status.into(),
            value: site.count.map(|c| c.value),
            within_low_cell_threshold: site.count.map(|c| c.within_low_cell_threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FederatedTotalDto {
    pub value: u64,
    pub within_low_cell_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FederatedCountDto {
    pub query_id: Uuid,
    pub preflight: PreflightDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<PatientCountDto>,
    /// Why the local count is missing, when it failed to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_error: Option<String>,
    pub sites: Vec<SiteResultDto>,
    pub total: FederatedTotalDto,
}

impl From<&FederatedCount> for FederatedCountDto {
    fn from(count: &FederatedCount) -> Self {
        Self {
            query_id: *count.query_id.as_uuid(),
            preflight: PreflightDto::from(&count.preflight),
            local: count.local.as_ref().map(PatientCountDto::from),
            local_error: count.local_error.map(|kind| kind.to_string()),
            sites: count.sites.iter().map(SiteResultDto::from).collect(),
            total: FederatedTotalDto {
                value: count.total.value,
                within_low_cell_threshold: count.total.within_low_cell_threshold,
            },
        }
    }
}

// ==================== Network administration ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointDraftDto {
    pub name: String,
    pub address: String,
    pub issuer: String,
    pub key_id: String,
    pub certificate: String,
    #[serde(default)]
    pub is_responder: bool,
    #[serde(default)]
    pub is_interrogator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl From<NetworkEndpointDraftDto> for NetworkEndpointDraft {
    fn from(dto: NetworkEndpointDraftDto) -> Self {
        Self {
            name: dto.name,
            address: dto.address,
            issuer: dto.issuer,
            key_id: dto.key_id,
            certificate: dto.certificate,
            is_responder: dto.is_responder,
            is_interrogator: dto.is_interrogator,
            timeout_secs: dto.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointDto {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub issuer: String,
    pub key_id: String,
    pub certificate: String,
    pub is_responder: bool,
    pub is_interrogator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<&NetworkEndpoint> for NetworkEndpointDto {
    fn from(endpoint: &NetworkEndpoint) -> Self {
        Self {
            id: endpoint.id,
            name: endpoint.name.to_string(),
            address: endpoint.address.to_string(),
            issuer: endpoint.issuer.to_string(),
            key_id: endpoint.key_id.to_string(),
            certificate: endpoint.certificate.to_string(),
            is_responder: endpoint.is_responder,
            is_interrogator: endpoint.is_interrogator,
            timeout_secs: endpoint.timeout.map(|t| t.as_secs()),
            created: endpoint.created,
            updated: endpoint.updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EndpointUpdateDto {
    pub old: NetworkEndpointDto,
    pub new: NetworkEndpointDto,
}

impl From<&UpdateResult<NetworkEndpoint>> for EndpointUpdateDto {
    fn from(update: &UpdateResult<NetworkEndpoint>) -> Self {
        Self {
            old: NetworkEndpointDto::from(&update.old),
            new: NetworkEndpointDto::from(&update.new),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct NetworkIdentityDto {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_patients: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_color: Option<String>,
}

impl From<&NetworkIdentity> for NetworkIdentityDto {
    fn from(identity: &NetworkIdentity) -> Self {
        Self {
            name: identity.name.to_string(),
            abbreviation: identity.abbreviation.clone(),
            description: identity.description.clone(),
            total_patients: identity.total_patients,
            latitude: identity.latitude,
            longitude: identity.longitude,
            primary_color: identity.primary_color.clone(),
            secondary_color: identity.secondary_color.clone(),
        }
    }
}

impl TryFrom<NetworkIdentityDto> for NetworkIdentity {
    type Error = LeafError;

    fn try_from(dto: NetworkIdentityDto) -> LeafResult<Self> {
        Ok(Self {
            name: leaf_types::NonEmptyText::new(&dto.name)?,
            abbreviation: dto.abbreviation,
            description: dto.description,
            total_patients: dto.total_patients,
            latitude: dto.latitude,
            longitude: dto.longitude,
            primary_color: dto.primary_color,
            secondary_color: dto.secondary_color,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IdentityUpdateDto {
    pub old: NetworkIdentityDto,
    pub new: NetworkIdentityDto,
}

impl From<&UpdateResult<NetworkIdentity>> for IdentityUpdateDto {
    fn from(update: &UpdateResult<NetworkIdentity>) -> Self {
        Self {
            old: NetworkIdentityDto::from(&update.old),
            new: NetworkIdentityDto::from(&update.new),
        }
    }
}
