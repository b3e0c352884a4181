//! Validated request commands and the patches they produce.
//!
//! Every body is deserialized with `deny_unknown_fields`; required values are
//! `Option` on the wire so a missing field is reported as a validation error
//! naming the field rather than as an opaque decode failure.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::model::{
    ActivityType, ContactType, ContractStatus, ContractType, EntityType, QuoteStatus, Stage,
};

pub(crate) fn required_text(field: &str, value: Option<String>) -> DomainResult<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(DomainError::validation(format!("{field} is required"))),
    }
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_negative(field: &str, value: Option<f64>) -> DomainResult<Option<f64>> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(DomainError::validation(format!(
            "{field} must be a non-negative number"
        ))),
        other => Ok(other),
    }
}

fn probability(value: Option<i64>) -> DomainResult<Option<u8>> {
    match value {
        None => Ok(None),
        Some(v) if (0..=100).contains(&v) => Ok(Some(v as u8)),
        Some(_) => Err(DomainError::validation("probability must be between 0 and 100")),
    }
}

fn parse_enum<T>(value: Option<String>) -> DomainResult<Option<T>>
where
    T: std::str::FromStr<Err = crate::model::UnknownVariant>,
{
    value
        .map(|v| v.parse::<T>())
        .transpose()
        .map_err(|e| DomainError::validation(e.to_string()))
}

fn date_order(
    start_field: &str,
    start: Option<DateTime<Utc>>,
    end_field: &str,
    end: Option<DateTime<Utc>>,
) -> DomainResult<()> {
    if let (Some(s), Some(e)) = (start, end) {
        if e < s {
            return Err(DomainError::validation(format!(
                "{end_field} must not be before {start_field}"
            )));
        }
    }
    Ok(())
}

/// Descriptive opportunity fields shared by create and update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpportunityPatch {
    pub title: Option<String>,
    pub agency: Option<String>,
    pub description: Option<String>,
    pub solicitation_number: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub probability: Option<u8>,
    pub estimated_value: Option<f64>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
}

impl OpportunityPatch {
    pub fn apply(&self, opp: &mut crate::model::PipelineOpportunity) {
        if let Some(v) = &self.title {
            opp.title = v.clone();
        }
        if let Some(v) = &self.agency {
            opp.agency = Some(v.clone());
        }
        if let Some(v) = &self.description {
            opp.description = Some(v.clone());
        }
        if let Some(v) = &self.solicitation_number {
            opp.solicitation_number = Some(v.clone());
        }
        if let Some(v) = &self.naics_code {
            opp.naics_code = Some(v.clone());
        }
        if let Some(v) = &self.set_aside_type {
            opp.set_aside_type = Some(v.clone());
        }
        if let Some(v) = self.probability {
            opp.probability = v;
        }
        if let Some(v) = self.estimated_value {
            opp.estimated_value = Some(v);
        }
        if let Some(v) = self.response_deadline {
            opp.response_deadline = Some(v);
        }
        if let Some(v) = &self.source_url {
            opp.source_url = Some(v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateOpportunity {
    pub title: Option<String>,
    pub agency: Option<String>,
    pub description: Option<String>,
    pub solicitation_number: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub stage: Option<String>,
    pub probability: Option<i64>,
    pub estimated_value: Option<f64>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOpportunity {
    pub title: String,
    pub stage: Stage,
    pub fields: OpportunityPatch,
}

impl CreateOpportunity {
    pub fn validate(self) -> DomainResult<NewOpportunity> {
        let title = required_text("title", self.title)?;
        let stage = parse_enum::<Stage>(self.stage)?.unwrap_or(Stage::Identified);
        let fields = OpportunityPatch {
            title: None,
            agency: optional_text(self.agency),
            description: optional_text(self.description),
            solicitation_number: optional_text(self.solicitation_number),
            naics_code: optional_text(self.naics_code),
            set_aside_type: optional_text(self.set_aside_type),
            probability: probability(self.probability)?,
            estimated_value: non_negative("estimatedValue", self.estimated_value)?,
            response_deadline: self.response_deadline,
            source_url: optional_text(self.source_url),
        };
        Ok(NewOpportunity {
            title,
            stage,
            fields,
        })
    }
}

/// Stage and status are intentionally absent; they move only through the
/// dedicated transitions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateOpportunity {
    pub title: Option<String>,
    pub agency: Option<String>,
    pub description: Option<String>,
    pub solicitation_number: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub probability: Option<i64>,
    pub estimated_value: Option<f64>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
}

impl UpdateOpportunity {
    pub fn validate(self) -> DomainResult<OpportunityPatch> {
        let title = match self.title {
            Some(t) => Some(required_text("title", Some(t))?),
            None => None,
        };
        let patch = OpportunityPatch {
            title,
            agency: optional_text(self.agency),
            description: optional_text(self.description),
            solicitation_number: optional_text(self.solicitation_number),
            naics_code: optional_text(self.naics_code),
            set_aside_type: optional_text(self.set_aside_type),
            probability: probability(self.probability)?,
            estimated_value: non_negative("estimatedValue", self.estimated_value)?,
            response_deadline: self.response_deadline,
            source_url: optional_text(self.source_url),
        };
        if patch.is_empty() {
            return Err(DomainError::validation("no updatable fields supplied"));
        }
        Ok(patch)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetStage {
    pub stage: Option<String>,
}

impl SetStage {
    pub fn validate(self) -> DomainResult<Stage> {
        let raw = required_text("stage", self.stage)?;
        raw.parse::<Stage>().map_err(|e| DomainError::Validation {
            message: e.to_string(),
            details: vec![format!(
                "stage must be one of: {}",
                Stage::ALL
                    .iter()
                    .map(Stage::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )],
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkWon {
    pub contract_number: Option<String>,
    pub award_amount: Option<f64>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub contract_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WonAward {
    pub contract_number: String,
    pub award_amount: Option<f64>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub contract_type: ContractType,
}

impl MarkWon {
    pub fn validate(self) -> DomainResult<WonAward> {
        let contract_number = required_text("contractNumber", self.contract_number)?;
        let award_amount = non_negative("awardAmount", self.award_amount)?;
        date_order("startDate", self.start_date, "endDate", self.end_date)?;
        let contract_type =
            parse_enum::<ContractType>(self.contract_type)?.unwrap_or(ContractType::FirmFixedPrice);
        Ok(WonAward {
            contract_number,
            award_amount,
            start_date: self.start_date,
            end_date: self.end_date,
            contract_type,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkLost {
    pub lost_reason: Option<String>,
    pub lost_feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LossDetails {
    pub reason: String,
    pub feedback: Option<String>,
}

impl MarkLost {
    pub fn validate(self) -> DomainResult<LossDetails> {
        Ok(LossDetails {
            reason: required_text("lostReason", self.lost_reason)?,
            feedback: optional_text(self.lost_feedback),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromoteExternal {
    pub organization_id: Option<String>,
}

impl PromoteExternal {
    pub fn validate(self) -> DomainResult<String> {
        required_text("organizationId", self.organization_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractPatch {
    pub contract_number: Option<String>,
    pub title: Option<String>,
    pub agency: Option<String>,
    pub contract_type: Option<ContractType>,
    pub status: Option<ContractStatus>,
    pub base_value: Option<f64>,
    pub total_value: Option<f64>,
    pub current_value: Option<f64>,
    pub award_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl ContractPatch {
    pub fn apply(&self, contract: &mut crate::model::Contract) {
        if let Some(v) = &self.contract_number {
            contract.contract_number = v.clone();
        }
        if let Some(v) = &self.title {
            contract.title = v.clone();
        }
        if let Some(v) = &self.agency {
            contract.agency = Some(v.clone());
        }
        if let Some(v) = self.contract_type {
            contract.contract_type = v;
        }
        if let Some(v) = self.status {
            contract.status = v;
        }
        if let Some(v) = self.base_value {
            contract.base_value = v;
        }
        if let Some(v) = self.total_value {
            contract.total_value = v;
        }
        if let Some(v) = self.current_value {
            contract.current_value = v;
        }
        if let Some(v) = self.award_date {
            contract.award_date = v;
        }
        if let Some(v) = self.start_date {
            contract.start_date = v;
        }
        if let Some(v) = self.end_date {
            contract.end_date = v;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateContract {
    pub contract_number: Option<String>,
    pub title: Option<String>,
    pub agency: Option<String>,
    pub contract_type: Option<String>,
    pub status: Option<String>,
    pub base_value: Option<f64>,
    pub total_value: Option<f64>,
    pub current_value: Option<f64>,
    pub award_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub opportunity_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewContract {
    pub contract_number: String,
    pub title: String,
    pub opportunity_id: Option<Uuid>,
    pub fields: ContractPatch,
}

impl CreateContract {
    pub fn validate(self) -> DomainResult<NewContract> {
        let contract_number = required_text("contractNumber", self.contract_number)?;
        let title = required_text("title", self.title)?;
        date_order("startDate", self.start_date, "endDate", self.end_date)?;
        Ok(NewContract {
            contract_number,
            title,
            opportunity_id: self.opportunity_id,
            fields: ContractPatch {
                contract_number: None,
                title: None,
                agency: optional_text(self.agency),
                contract_type: parse_enum(self.contract_type)?,
                status: parse_enum(self.status)?,
                base_value: non_negative("baseValue", self.base_value)?,
                total_value: non_negative("totalValue", self.total_value)?,
                current_value: non_negative("currentValue", self.current_value)?,
                award_date: self.award_date,
                start_date: self.start_date,
                end_date: self.end_date,
            },
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateContract {
    pub contract_number: Option<String>,
    pub title: Option<String>,
    pub agency: Option<String>,
    pub contract_type: Option<String>,
    pub status: Option<String>,
    pub base_value: Option<f64>,
    pub total_value: Option<f64>,
    pub current_value: Option<f64>,
    pub award_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl UpdateContract {
    pub fn validate(self) -> DomainResult<ContractPatch> {
        let contract_number = match self.contract_number {
            Some(n) => Some(required_text("contractNumber", Some(n))?),
            None => None,
        };
        let title = match self.title {
            Some(t) => Some(required_text("title", Some(t))?),
            None => None,
        };
        date_order("startDate", self.start_date, "endDate", self.end_date)?;
        let patch = ContractPatch {
            contract_number,
            title,
            agency: optional_text(self.agency),
            contract_type: parse_enum(self.contract_type)?,
            status: parse_enum(self.status)?,
            base_value: non_negative("baseValue", self.base_value)?,
            total_value: non_negative("totalValue", self.total_value)?,
            current_value: non_negative("currentValue", self.current_value)?,
            award_date: self.award_date,
            start_date: self.start_date,
            end_date: self.end_date,
        };
        if patch.is_empty() {
            return Err(DomainError::validation("no updatable fields supplied"));
        }
        Ok(patch)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotePatch {
    pub amount: Option<f64>,
    pub quote_date: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: Option<QuoteStatus>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

impl QuotePatch {
    pub fn apply(&self, quote: &mut crate::model::Quote) {
        if let Some(v) = self.amount {
            quote.amount = v;
        }
        if let Some(v) = self.quote_date {
            quote.quote_date = v;
        }
        if let Some(v) = self.valid_until {
            quote.valid_until = Some(v);
        }
        if let Some(v) = self.status {
            quote.status = v;
        }
        if let Some(v) = &self.description {
            quote.description = Some(v.clone());
        }
        if let Some(v) = &self.notes {
            quote.notes = Some(v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateQuote {
    pub opportunity_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub amount: Option<f64>,
    pub quote_date: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewQuote {
    pub opportunity_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub amount: f64,
    pub quote_date: DateTime<Utc>,
    pub fields: QuotePatch,
}

impl CreateQuote {
    pub fn validate(self) -> DomainResult<NewQuote> {
        let amount = non_negative("amount", self.amount)?
            .ok_or_else(|| DomainError::validation("amount is required"))?;
        let quote_date = self
            .quote_date
            .ok_or_else(|| DomainError::validation("quoteDate is required"))?;
        date_order("quoteDate", Some(quote_date), "validUntil", self.valid_until)?;
        Ok(NewQuote {
            opportunity_id: self.opportunity_id,
            subcontractor_id: self.subcontractor_id,
            amount,
            quote_date,
            fields: QuotePatch {
                amount: None,
                quote_date: None,
                valid_until: self.valid_until,
                status: parse_enum(self.status)?,
                description: optional_text(self.description),
                notes: optional_text(self.notes),
            },
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateQuote {
    pub amount: Option<f64>,
    pub quote_date: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

impl UpdateQuote {
    pub fn validate(self) -> DomainResult<QuotePatch> {
        let patch = QuotePatch {
            amount: non_negative("amount", self.amount)?,
            quote_date: self.quote_date,
            valid_until: self.valid_until,
            status: parse_enum(self.status)?,
            description: optional_text(self.description),
            notes: optional_text(self.notes),
        };
        if patch.is_empty() {
            return Err(DomainError::validation("no updatable fields supplied"));
        }
        Ok(patch)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubcontractorPatch {
    pub company_name: Option<String>,
    pub duns: Option<String>,
    pub cage_code: Option<String>,
    pub uei: Option<String>,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub certifications: Option<Vec<String>>,
    pub naics_codes: Option<Vec<String>>,
    pub sam_registered: Option<bool>,
    pub notes: Option<String>,
}

impl SubcontractorPatch {
    pub fn apply(&self, sub: &mut crate::model::Subcontractor) {
        if let Some(v) = &self.company_name {
            sub.company_name = v.clone();
        }
        let texts = [
            (&self.duns, &mut sub.duns),
            (&self.cage_code, &mut sub.cage_code),
            (&self.uei, &mut sub.uei),
            (&self.contact_name, &mut sub.contact_name),
            (&self.email, &mut sub.email),
            (&self.phone, &mut sub.phone),
            (&self.website, &mut sub.website),
            (&self.address, &mut sub.address),
            (&self.notes, &mut sub.notes),
        ];
        for (value, slot) in texts {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        if let Some(v) = &self.capabilities {
            sub.capabilities = v.clone();
        }
        if let Some(v) = &self.certifications {
            sub.certifications = v.clone();
        }
        if let Some(v) = &self.naics_codes {
            sub.naics_codes = v.clone();
        }
        if let Some(v) = self.sam_registered {
            sub.sam_registered = v;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn clean_list(values: Option<Vec<String>>) -> Option<Vec<String>> {
    values.map(|vs| {
        vs.into_iter()
            .filter_map(|v| optional_text(Some(v)))
            .collect()
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubcontractorFields {
    pub company_name: Option<String>,
    pub duns: Option<String>,
    pub cage_code: Option<String>,
    pub uei: Option<String>,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub certifications: Option<Vec<String>>,
    pub naics_codes: Option<Vec<String>>,
    pub sam_registered: Option<bool>,
    pub notes: Option<String>,
}

impl SubcontractorFields {
    fn into_patch(self) -> DomainResult<SubcontractorPatch> {
        let company_name = match self.company_name {
            Some(n) => Some(required_text("companyName", Some(n))?),
            None => None,
        };
        if let Some(email) = self.email.as_deref().map(str::trim) {
            if !email.is_empty() && !email.contains('@') {
                return Err(DomainError::validation("email must be a valid address"));
            }
        }
        Ok(SubcontractorPatch {
            company_name,
            duns: optional_text(self.duns),
            cage_code: optional_text(self.cage_code),
            uei: optional_text(self.uei),
            contact_name: optional_text(self.contact_name),
            email: optional_text(self.email),
            phone: optional_text(self.phone),
            website: optional_text(self.website),
            address: optional_text(self.address),
            capabilities: clean_list(self.capabilities),
            certifications: clean_list(self.certifications),
            naics_codes: clean_list(self.naics_codes),
            sam_registered: self.sam_registered,
            notes: optional_text(self.notes),
        })
    }

    /// Create: company name is mandatory.
    pub fn validate_new(self) -> DomainResult<(String, SubcontractorPatch)> {
        let mut patch = self.into_patch()?;
        let name = patch
            .company_name
            .take()
            .ok_or_else(|| DomainError::validation("companyName is required"))?;
        Ok((name, patch))
    }

    pub fn validate_update(self) -> DomainResult<SubcontractorPatch> {
        let patch = self.into_patch()?;
        if patch.is_empty() {
            return Err(DomainError::validation("no updatable fields supplied"));
        }
        Ok(patch)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AssignTeamMember {
    pub user_id: Option<String>,
    pub role: Option<String>,
}

pub const DEFAULT_TEAM_ROLE: &str = "member";

impl AssignTeamMember {
    pub fn validate(self) -> DomainResult<(String, String)> {
        let user_id = required_text("userId", self.user_id)?;
        let role = optional_text(self.role).unwrap_or_else(|| DEFAULT_TEAM_ROLE.to_string());
        Ok((user_id, role))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateContactLog {
    pub opportunity_id: Option<Uuid>,
    pub contact_type: Option<String>,
    pub summary: Option<String>,
    pub contact_date: Option<DateTime<Utc>>,
    pub follow_up_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewContactLog {
    pub opportunity_id: Option<Uuid>,
    pub contact_type: ContactType,
    pub summary: String,
    pub contact_date: Option<DateTime<Utc>>,
    pub follow_up_date: Option<DateTime<Utc>>,
}

impl CreateContactLog {
    pub fn validate(self) -> DomainResult<NewContactLog> {
        let summary = required_text("summary", self.summary)?;
        date_order(
            "contactDate",
            self.contact_date,
            "followUpDate",
            self.follow_up_date,
        )?;
        Ok(NewContactLog {
            opportunity_id: self.opportunity_id,
            contact_type: parse_enum(self.contact_type)?.unwrap_or(ContactType::Other),
            summary,
            contact_date: self.contact_date,
            follow_up_date: self.follow_up_date,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateActivity {
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub activity_type: Option<String>,
    pub description: Option<String>,
    pub opportunity_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub activity_type: ActivityType,
    pub description: String,
    pub opportunity_id: Option<Uuid>,
    pub contract_id: Option<Uuid>,
    pub subcontractor_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

impl CreateActivity {
    pub fn validate(self) -> DomainResult<NewActivity> {
        let entity_type = parse_enum::<EntityType>(self.entity_type)?
            .ok_or_else(|| DomainError::validation("entityType is required"))?;
        let entity_id = self
            .entity_id
            .ok_or_else(|| DomainError::validation("entityId is required"))?;
        Ok(NewActivity {
            entity_type,
            entity_id,
            activity_type: parse_enum(self.activity_type)?.unwrap_or(ActivityType::Note),
            description: required_text("description", self.description)?,
            opportunity_id: self.opportunity_id,
            contract_id: self.contract_id,
            subcontractor_id: self.subcontractor_id,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_lost_requires_a_reason() {
        let err = MarkLost {
            lost_reason: Some("   ".into()),
            lost_feedback: None,
        }
        .validate()
        .unwrap_err();
        assert_eq!(err, DomainError::validation("lostReason is required"));
    }

    #[test]
    fn mark_won_requires_contract_number_and_orders_dates() {
        let err = MarkWon::default().validate().unwrap_err();
        assert_eq!(err, DomainError::validation("contractNumber is required"));

        let start = Utc::now();
        let err = MarkWon {
            contract_number: Some("C-1".into()),
            start_date: Some(start),
            end_date: Some(start - chrono::Duration::days(1)),
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));

        let award = MarkWon {
            contract_number: Some(" C-1 ".into()),
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(award.contract_number, "C-1");
        assert_eq!(award.contract_type, ContractType::FirmFixedPrice);
    }

    #[test]
    fn set_stage_rejects_unknown_stage_with_details() {
        let err = SetStage {
            stage: Some("NotAStage".into()),
        }
        .validate()
        .unwrap_err();
        match err {
            DomainError::Validation { message, details } => {
                assert!(message.contains("NotAStage"));
                assert_eq!(details.len(), 1);
                assert!(details[0].contains("proposal_development"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected_at_decode_time() {
        let err = serde_json::from_value::<UpdateOpportunity>(serde_json::json!({
            "title": "x",
            "status": "won"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown field `status`"));
    }

    #[test]
    fn create_opportunity_validates_probability_range() {
        let err = CreateOpportunity {
            title: Some("t".into()),
            probability: Some(101),
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert_eq!(
            err,
            DomainError::validation("probability must be between 0 and 100")
        );
    }

    #[test]
    fn create_quote_requires_amount_and_date() {
        let err = CreateQuote::default().validate().unwrap_err();
        assert_eq!(err, DomainError::validation("amount is required"));
        let err = CreateQuote {
            amount: Some(10.0),
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert_eq!(err, DomainError::validation("quoteDate is required"));
    }

    #[test]
    fn subcontractor_requires_company_name_and_cleans_lists() {
        let err = SubcontractorFields::default().validate_new().unwrap_err();
        assert_eq!(err, DomainError::validation("companyName is required"));

        let (name, patch) = SubcontractorFields {
            company_name: Some("Acme".into()),
            capabilities: Some(vec!["cyber".into(), "  ".into()]),
            ..Default::default()
        }
        .validate_new()
        .unwrap();
        assert_eq!(name, "Acme");
        assert_eq!(patch.capabilities, Some(vec!["cyber".to_string()]));
    }

    #[test]
    fn empty_update_is_rejected() {
        assert!(UpdateQuote::default().validate().is_err());
        assert!(UpdateContract::default().validate().is_err());
        assert!(SubcontractorFields::default().validate_update().is_err());
    }
}
