//! Postgres-backed `PipelineStore`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcpt_core::command::{ContractPatch, LossDetails, OpportunityPatch, QuotePatch, SubcontractorPatch};
use gcpt_core::{
    Activity, ConflictKind, ContactLog, Contract, ExternalListing, ExternalOpportunity,
    ExternalStats, OpportunityStatus, PipelineOpportunity, Quote, Stage, Subcontractor,
    TeamMember, UnknownVariant, UpsertOutcome,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use tracing::info;
use uuid::Uuid;

use crate::{
    lost_conflict, won_conflict, ActivityFilter, ActivityOutbox, ActivitySink, ContractFilter,
    ExternalFilter, OpportunityFilter, PipelineStore, QuoteFilter, StoreError, StoreResult, SubcontractorFilter,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn unique_as(kind: ConflictKind) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| {
        if is_unique_violation(&err) {
            StoreError::Conflict(kind)
        } else {
            StoreError::Database(err)
        }
    }
}

fn text_column<T>(row: &PgRow, column: &str, table: &'static str) -> StoreResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|err: UnknownVariant| StoreError::Corrupt {
        table,
        message: err.to_string(),
    })
}

fn pct_column(row: &PgRow, column: &str, table: &'static str) -> StoreResult<u8> {
    let raw: i16 = row.try_get(column)?;
    u8::try_from(raw).map_err(|_| StoreError::Corrupt {
        table,
        message: format!("{column} out of range: {raw}"),
    })
}

fn external_from_row(row: &PgRow) -> StoreResult<ExternalOpportunity> {
    Ok(ExternalOpportunity {
        id: row.try_get("id")?,
        listing: ExternalListing {
            notice_id: row.try_get("notice_id")?,
            solicitation_number: row.try_get("solicitation_number")?,
            title: row.try_get("title")?,
            agency: row.try_get("agency")?,
            office: row.try_get("office")?,
            notice_type: row.try_get("notice_type")?,
            naics_code: row.try_get("naics_code")?,
            classification_code: row.try_get("classification_code")?,
            set_aside_type: row.try_get("set_aside_type")?,
            set_aside_description: row.try_get("set_aside_description")?,
            posted_date: row.try_get("posted_date")?,
            response_deadline: row.try_get("response_deadline")?,
            archive_date: row.try_get("archive_date")?,
            estimated_value: row.try_get("estimated_value")?,
            place_of_performance_state: row.try_get("place_of_performance_state")?,
            point_of_contact: row.try_get("point_of_contact")?,
            description_url: row.try_get("description_url")?,
            ui_link: row.try_get("ui_link")?,
            active: row.try_get("active")?,
        },
        added_to_pipeline: row.try_get("added_to_pipeline")?,
        added_to_pipeline_at: row.try_get("added_to_pipeline_at")?,
        first_synced_at: row.try_get("first_synced_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn opportunity_from_row(row: &PgRow) -> StoreResult<PipelineOpportunity> {
    const T: &str = "opportunities";
    Ok(PipelineOpportunity {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        external_opportunity_id: row.try_get("external_opportunity_id")?,
        notice_id: row.try_get("notice_id")?,
        solicitation_number: row.try_get("solicitation_number")?,
        title: row.try_get("title")?,
        agency: row.try_get("agency")?,
        description: row.try_get("description")?,
        naics_code: row.try_get("naics_code")?,
        set_aside_type: row.try_get("set_aside_type")?,
        stage: text_column(row, "stage", T)?,
        status: text_column(row, "status", T)?,
        probability: pct_column(row, "probability", T)?,
        estimated_value: row.try_get("estimated_value")?,
        posted_date: row.try_get("posted_date")?,
        response_deadline: row.try_get("response_deadline")?,
        source_url: row.try_get("source_url")?,
        contract_number: row.try_get("contract_number")?,
        won_date: row.try_get("won_date")?,
        lost_date: row.try_get("lost_date")?,
        lost_reason: row.try_get("lost_reason")?,
        lost_feedback: row.try_get("lost_feedback")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn contract_from_row(row: &PgRow) -> StoreResult<Contract> {
    const T: &str = "contracts";
    Ok(Contract {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        contract_number: row.try_get("contract_number")?,
        title: row.try_get("title")?,
        agency: row.try_get("agency")?,
        contract_type: text_column(row, "contract_type", T)?,
        status: text_column(row, "status", T)?,
        base_value: row.try_get("base_value")?,
        total_value: row.try_get("total_value")?,
        current_value: row.try_get("current_value")?,
        award_date: row.try_get("award_date")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        opportunity_id: row.try_get("opportunity_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn quote_from_row(row: &PgRow) -> StoreResult<Quote> {
    Ok(Quote {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        subcontractor_id: row.try_get("subcontractor_id")?,
        amount: row.try_get("amount")?,
        quote_date: row.try_get("quote_date")?,
        valid_until: row.try_get("valid_until")?,
        status: text_column(row, "status", "quotes")?,
        description: row.try_get("description")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subcontractor_from_row(row: &PgRow) -> StoreResult<Subcontractor> {
    Ok(Subcontractor {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        company_name: row.try_get("company_name")?,
        duns: row.try_get("duns")?,
        cage_code: row.try_get("cage_code")?,
        uei: row.try_get("uei")?,
        contact_name: row.try_get("contact_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        address: row.try_get("address")?,
        capabilities: row.try_get("capabilities")?,
        certifications: row.try_get("certifications")?,
        naics_codes: row.try_get("naics_codes")?,
        sam_registered: row.try_get("sam_registered")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn team_member_from_row(row: &PgRow) -> StoreResult<TeamMember> {
    Ok(TeamMember {
        id: row.try_get("id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        user_id: row.try_get("user_id")?,
        role: row.try_get("role")?,
        assigned_by: row.try_get("assigned_by")?,
        assigned_at: row.try_get("assigned_at")?,
    })
}

/// Backslash-escape LIKE metacharacters; queries pair this with `ESCAPE '\'`.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Case-insensitive substring pattern for `ILIKE`.
fn contains_pattern(raw: Option<&str>) -> Option<String> {
    raw.map(|r| format!("%{}%", escape_like(r)))
}

fn activity_from_row(row: &PgRow) -> StoreResult<Activity> {
    const T: &str = "activities";
    Ok(Activity {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        entity_type: text_column(row, "entity_type", T)?,
        entity_id: row.try_get("entity_id")?,
        activity_type: text_column(row, "activity_type", T)?,
        description: row.try_get("description")?,
        actor_id: row.try_get("actor_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        contract_id: row.try_get("contract_id")?,
        subcontractor_id: row.try_get("subcontractor_id")?,
        metadata: row.try_get("metadata")?,
        activity_date: row.try_get("activity_date")?,
    })
}

fn contact_log_from_row(row: &PgRow) -> StoreResult<ContactLog> {
    Ok(ContactLog {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        subcontractor_id: row.try_get("subcontractor_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        contact_type: text_column(row, "contact_type", "contact_logs")?,
        summary: row.try_get("summary")?,
        contacted_by: row.try_get("contacted_by")?,
        contact_date: row.try_get("contact_date")?,
        follow_up_date: row.try_get("follow_up_date")?,
    })
}

async fn insert_opportunity_row(conn: &mut PgConnection, opp: &PipelineOpportunity) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO opportunities (
            id, organization_id, external_opportunity_id, notice_id, solicitation_number,
            title, agency, description, naics_code, set_aside_type, stage, status,
            probability, estimated_value, posted_date, response_deadline, source_url,
            contract_number, won_date, lost_date, lost_reason, lost_feedback,
            created_by, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
        )
        "#,
    )
    .bind(opp.id)
    .bind(&opp.organization_id)
    .bind(opp.external_opportunity_id)
    .bind(&opp.notice_id)
    .bind(&opp.solicitation_number)
    .bind(&opp.title)
    .bind(&opp.agency)
    .bind(&opp.description)
    .bind(&opp.naics_code)
    .bind(&opp.set_aside_type)
    .bind(opp.stage.as_str())
    .bind(opp.status.as_str())
    .bind(i16::from(opp.probability))
    .bind(opp.estimated_value)
    .bind(opp.posted_date)
    .bind(opp.response_deadline)
    .bind(&opp.source_url)
    .bind(&opp.contract_number)
    .bind(opp.won_date)
    .bind(opp.lost_date)
    .bind(&opp.lost_reason)
    .bind(&opp.lost_feedback)
    .bind(&opp.created_by)
    .bind(opp.created_at)
    .bind(opp.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Rewrites every mutable column of an opportunity already locked by the caller.
async fn write_opportunity_row(conn: &mut PgConnection, opp: &PipelineOpportunity) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE opportunities
           SET solicitation_number = $2,
               title = $3,
               agency = $4,
               description = $5,
               naics_code = $6,
               set_aside_type = $7,
               stage = $8,
               status = $9,
               probability = $10,
               estimated_value = $11,
               response_deadline = $12,
               source_url = $13,
               lost_date = $14,
               lost_reason = $15,
               lost_feedback = $16,
               updated_at = $17
         WHERE id = $1
        "#,
    )
    .bind(opp.id)
    .bind(&opp.solicitation_number)
    .bind(&opp.title)
    .bind(&opp.agency)
    .bind(&opp.description)
    .bind(&opp.naics_code)
    .bind(&opp.set_aside_type)
    .bind(opp.stage.as_str())
    .bind(opp.status.as_str())
    .bind(i16::from(opp.probability))
    .bind(opp.estimated_value)
    .bind(opp.response_deadline)
    .bind(&opp.source_url)
    .bind(opp.lost_date)
    .bind(&opp.lost_reason)
    .bind(&opp.lost_feedback)
    .bind(opp.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn lock_opportunity(conn: &mut PgConnection, id: Uuid) -> StoreResult<PipelineOpportunity> {
    let row = sqlx::query("SELECT * FROM opportunities WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("opportunity", id))?;
    opportunity_from_row(&row)
}

async fn insert_contract_row(conn: &mut PgConnection, contract: &Contract) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO contracts (
            id, organization_id, contract_number, title, agency, contract_type, status,
            base_value, total_value, current_value, award_date, start_date, end_date,
            opportunity_id, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(contract.id)
    .bind(&contract.organization_id)
    .bind(&contract.contract_number)
    .bind(&contract.title)
    .bind(&contract.agency)
    .bind(contract.contract_type.as_str())
    .bind(contract.status.as_str())
    .bind(contract.base_value)
    .bind(contract.total_value)
    .bind(contract.current_value)
    .bind(contract.award_date)
    .bind(contract.start_date)
    .bind(contract.end_date)
    .bind(contract.opportunity_id)
    .bind(contract.created_at)
    .bind(contract.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(unique_as(ConflictKind::DuplicateContractNumber))?;
    Ok(())
}

#[async_trait]
impl ActivitySink for PgStore {
    async fn append_activity(&self, activity: Activity) -> StoreResult<Activity> {
        sqlx::query(
            r#"
            INSERT INTO activities (
                id, organization_id, entity_type, entity_id, activity_type, description,
                actor_id, opportunity_id, contract_id, subcontractor_id, metadata, activity_date
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8,
                   (SELECT id FROM contracts WHERE id = $9),
                   (SELECT id FROM subcontractors WHERE id = $10),
                   $11, $12
             WHERE $8::uuid IS NULL OR EXISTS (SELECT 1 FROM opportunities WHERE id = $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(activity.id)
        .bind(&activity.organization_id)
        .bind(activity.entity_type.as_str())
        .bind(activity.entity_id)
        .bind(activity.activity_type.as_str())
        .bind(&activity.description)
        .bind(&activity.actor_id)
        .bind(activity.opportunity_id)
        .bind(activity.contract_id)
        .bind(activity.subcontractor_id)
        .bind(&activity.metadata)
        .bind(activity.activity_date)
        .execute(&self.pool)
        .await?;
        Ok(activity)
    }
}

/// Replays apply the same cascades as live rows: an entry whose opportunity
/// is gone is skipped, dangling contract and subcontractor links are nulled.
#[async_trait]
impl ActivityOutbox for PgStore {
    async fn queue_activity(&self, activity: &Activity) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_outbox (activity_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (activity_id) DO NOTHING
            "#,
        )
        .bind(activity.id)
        .bind(Json(activity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_queued(&self, limit: usize) -> StoreResult<Vec<Activity>> {
        let rows = sqlx::query("SELECT payload FROM activity_outbox ORDER BY seq ASC LIMIT $1")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let Json(activity): Json<Activity> = row.try_get("payload")?;
                Ok(activity)
            })
            .collect()
    }

    async fn mark_delivered(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM activity_outbox WHERE activity_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn queued_count(&self) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM activity_outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn upsert_external(
        &self,
        listing: ExternalListing,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        // Never touches added_to_pipeline; promotion owns that flag.
        let row = sqlx::query(
            r#"
            INSERT INTO external_opportunities (
                id, notice_id, solicitation_number, title, agency, office, notice_type,
                naics_code, classification_code, set_aside_type, set_aside_description,
                posted_date, response_deadline, archive_date, estimated_value,
                place_of_performance_state, point_of_contact, description_url, ui_link,
                active, first_synced_at, last_synced_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $21
            )
            ON CONFLICT (notice_id) DO UPDATE SET
                solicitation_number = EXCLUDED.solicitation_number,
                title = EXCLUDED.title,
                agency = EXCLUDED.agency,
                office = EXCLUDED.office,
                notice_type = EXCLUDED.notice_type,
                naics_code = EXCLUDED.naics_code,
                classification_code = EXCLUDED.classification_code,
                set_aside_type = EXCLUDED.set_aside_type,
                set_aside_description = EXCLUDED.set_aside_description,
                posted_date = EXCLUDED.posted_date,
                response_deadline = EXCLUDED.response_deadline,
                archive_date = EXCLUDED.archive_date,
                estimated_value = EXCLUDED.estimated_value,
                place_of_performance_state = EXCLUDED.place_of_performance_state,
                point_of_contact = EXCLUDED.point_of_contact,
                description_url = EXCLUDED.description_url,
                ui_link = EXCLUDED.ui_link,
                active = EXCLUDED.active,
                last_synced_at = EXCLUDED.last_synced_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&listing.notice_id)
        .bind(&listing.solicitation_number)
        .bind(&listing.title)
        .bind(&listing.agency)
        .bind(&listing.office)
        .bind(&listing.notice_type)
        .bind(&listing.naics_code)
        .bind(&listing.classification_code)
        .bind(&listing.set_aside_type)
        .bind(&listing.set_aside_description)
        .bind(listing.posted_date)
        .bind(listing.response_deadline)
        .bind(listing.archive_date)
        .bind(listing.estimated_value)
        .bind(&listing.place_of_performance_state)
        .bind(&listing.point_of_contact)
        .bind(&listing.description_url)
        .bind(&listing.ui_link)
        .bind(listing.active)
        .bind(synced_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get_external(&self, id: Uuid) -> StoreResult<Option<ExternalOpportunity>> {
        let row = sqlx::query("SELECT * FROM external_opportunities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| external_from_row(&r)).transpose()
    }

    async fn list_external(&self, filter: &ExternalFilter) -> StoreResult<Vec<ExternalOpportunity>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM external_opportunities
             WHERE ($1::text IS NULL OR naics_code = $1)
               AND ($2::text IS NULL OR set_aside_type ILIKE $2 ESCAPE '\')
               AND ($3::bool IS NULL OR added_to_pipeline = $3)
               AND ($4::text IS NULL
                    OR title ILIKE $4 ESCAPE '\'
                    OR agency ILIKE $4 ESCAPE '\'
                    OR solicitation_number ILIKE $4 ESCAPE '\'
                    OR notice_id ILIKE $4 ESCAPE '\')
             ORDER BY posted_date DESC NULLS LAST, notice_id ASC
             LIMIT $5
            "#,
        )
        .bind(&filter.naics_code)
        .bind(filter.set_aside.as_deref().map(escape_like))
        .bind(filter.in_pipeline)
        .bind(contains_pattern(filter.search.as_deref()))
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(external_from_row).collect()
    }

    async fn external_stats(&self) -> StoreResult<ExternalStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE added_to_pipeline) AS in_pipeline,
                   MAX(last_synced_at) AS last_synced_at
              FROM external_opportunities
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let in_pipeline: i64 = row.try_get("in_pipeline")?;
        Ok(ExternalStats {
            total: total.max(0) as u64,
            in_pipeline: in_pipeline.max(0) as u64,
            last_synced_at: row.try_get("last_synced_at")?,
        })
    }

    async fn promote_external(
        &self,
        external_id: Uuid,
        opportunity: PipelineOpportunity,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity> {
        let mut tx = self.pool.begin().await?;
        let flipped = sqlx::query(
            r#"
            UPDATE external_opportunities
               SET added_to_pipeline = TRUE,
                   added_to_pipeline_at = $2
             WHERE id = $1 AND added_to_pipeline = FALSE
            "#,
        )
        .bind(external_id)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if flipped == 0 {
            let exists: Option<bool> =
                sqlx::query_scalar("SELECT added_to_pipeline FROM external_opportunities WHERE id = $1")
                    .bind(external_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match exists {
                None => StoreError::not_found("external opportunity", external_id),
                Some(_) => ConflictKind::AlreadyInPipeline.into(),
            });
        }

        insert_opportunity_row(&mut tx, &opportunity).await?;
        tx.commit().await?;
        Ok(opportunity)
    }

    async fn insert_opportunity(&self, opp: PipelineOpportunity) -> StoreResult<PipelineOpportunity> {
        let mut conn = self.pool.acquire().await?;
        insert_opportunity_row(&mut conn, &opp).await?;
        Ok(opp)
    }

    async fn get_opportunity(&self, id: Uuid) -> StoreResult<Option<PipelineOpportunity>> {
        let row = sqlx::query("SELECT * FROM opportunities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| opportunity_from_row(&r)).transpose()
    }

    async fn list_opportunities(&self, filter: &OpportunityFilter) -> StoreResult<Vec<PipelineOpportunity>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM opportunities
             WHERE ($1::text IS NULL OR stage = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR agency ILIKE $3 ESCAPE '\')
               AND ($4::text IS NULL
                    OR title ILIKE $4 ESCAPE '\'
                    OR agency ILIKE $4 ESCAPE '\'
                    OR solicitation_number ILIKE $4 ESCAPE '\'
                    OR notice_id ILIKE $4 ESCAPE '\')
             ORDER BY response_deadline ASC NULLS LAST, created_at DESC
            "#,
        )
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(contains_pattern(filter.agency.as_deref()))
        .bind(contains_pattern(filter.search.as_deref()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn update_opportunity(
        &self,
        id: Uuid,
        patch: &OpportunityPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity> {
        let mut tx = self.pool.begin().await?;
        let mut opp = lock_opportunity(&mut tx, id).await?;
        patch.apply(&mut opp);
        opp.updated_at = at;
        write_opportunity_row(&mut tx, &opp).await?;
        tx.commit().await?;
        Ok(opp)
    }

    async fn set_stage(
        &self,
        id: Uuid,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> StoreResult<(Stage, PipelineOpportunity)> {
        let mut tx = self.pool.begin().await?;
        let mut opp = lock_opportunity(&mut tx, id).await?;
        if opp.is_closed() {
            return Err(ConflictKind::OpportunityClosed.into());
        }
        let previous = opp.stage;
        opp.stage = stage;
        opp.updated_at = at;
        write_opportunity_row(&mut tx, &opp).await?;
        tx.commit().await?;
        Ok((previous, opp))
    }

    async fn mark_won(
        &self,
        id: Uuid,
        contract: Contract,
        at: DateTime<Utc>,
    ) -> StoreResult<(PipelineOpportunity, Contract)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE opportunities
               SET status = 'won',
                   stage = 'submitted',
                   won_date = $2,
                   contract_number = $3,
                   updated_at = $2
             WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(&contract.contract_number)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM opportunities WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let status = status.ok_or_else(|| StoreError::not_found("opportunity", id))?;
            let status = OpportunityStatus::from_str(&status).map_err(|err| StoreError::Corrupt {
                table: "opportunities",
                message: err.to_string(),
            })?;
            return Err(won_conflict(status).into());
        };
        let opp = opportunity_from_row(&row)?;

        insert_contract_row(&mut tx, &contract).await?;
        tx.commit().await?;
        Ok((opp, contract))
    }

    async fn mark_lost(
        &self,
        id: Uuid,
        loss: &LossDetails,
        at: DateTime<Utc>,
    ) -> StoreResult<PipelineOpportunity> {
        let mut tx = self.pool.begin().await?;
        let mut opp = lock_opportunity(&mut tx, id).await?;
        if opp.status != OpportunityStatus::Active {
            return Err(lost_conflict(opp.status).into());
        }
        opp.status = OpportunityStatus::Lost;
        opp.lost_date = Some(at);
        opp.lost_reason = Some(loss.reason.clone());
        opp.lost_feedback = loss.feedback.clone();
        opp.updated_at = at;
        write_opportunity_row(&mut tx, &opp).await?;
        tx.commit().await?;
        Ok(opp)
    }

    async fn remove_opportunity(&self, id: Uuid) -> StoreResult<PipelineOpportunity> {
        let mut tx = self.pool.begin().await?;
        let opp = lock_opportunity(&mut tx, id).await?;
        if let Some(source_id) = opp.external_opportunity_id {
            sqlx::query(
                r#"
                UPDATE external_opportunities
                   SET added_to_pipeline = FALSE,
                       added_to_pipeline_at = NULL
                 WHERE id = $1
                "#,
            )
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM opportunities WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(opp)
    }

    async fn insert_contract(&self, contract: Contract) -> StoreResult<Contract> {
        let mut conn = self.pool.acquire().await?;
        insert_contract_row(&mut conn, &contract).await?;
        Ok(contract)
    }

    async fn get_contract(&self, id: Uuid) -> StoreResult<Option<Contract>> {
        let row = sqlx::query("SELECT * FROM contracts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| contract_from_row(&r)).transpose()
    }

    async fn list_contracts(&self, filter: &ContractFilter) -> StoreResult<Vec<Contract>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM contracts
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL
                    OR title ILIKE $2 ESCAPE '\'
                    OR contract_number ILIKE $2 ESCAPE '\'
                    OR agency ILIKE $2 ESCAPE '\')
             ORDER BY award_date DESC
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(contains_pattern(filter.search.as_deref()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contract_from_row).collect()
    }

    async fn update_contract(
        &self,
        id: Uuid,
        patch: &ContractPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Contract> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM contracts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("contract", id))?;
        let mut contract = contract_from_row(&row)?;
        patch.apply(&mut contract);
        contract.updated_at = at;

        sqlx::query(
            r#"
            UPDATE contracts
               SET contract_number = $2,
                   title = $3,
                   agency = $4,
                   contract_type = $5,
                   status = $6,
                   base_value = $7,
                   total_value = $8,
                   current_value = $9,
                   award_date = $10,
                   start_date = $11,
                   end_date = $12,
                   updated_at = $13
             WHERE id = $1
            "#,
        )
        .bind(contract.id)
        .bind(&contract.contract_number)
        .bind(&contract.title)
        .bind(&contract.agency)
        .bind(contract.contract_type.as_str())
        .bind(contract.status.as_str())
        .bind(contract.base_value)
        .bind(contract.total_value)
        .bind(contract.current_value)
        .bind(contract.award_date)
        .bind(contract.start_date)
        .bind(contract.end_date)
        .bind(contract.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(unique_as(ConflictKind::DuplicateContractNumber))?;
        tx.commit().await?;
        Ok(contract)
    }

    async fn delete_contract(&self, id: Uuid) -> StoreResult<Contract> {
        let row = sqlx::query("DELETE FROM contracts WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("contract", id))?;
        contract_from_row(&row)
    }

    async fn revert_contract(
        &self,
        id: Uuid,
        reopened: PipelineOpportunity,
    ) -> StoreResult<(Contract, PipelineOpportunity)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("DELETE FROM contracts WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("contract", id))?;
        let contract = contract_from_row(&row)?;
        insert_opportunity_row(&mut tx, &reopened).await?;
        tx.commit().await?;
        Ok((contract, reopened))
    }

    async fn insert_quote(&self, quote: Quote) -> StoreResult<Quote> {
        sqlx::query(
            r#"
            INSERT INTO quotes (
                id, organization_id, opportunity_id, subcontractor_id, amount, quote_date,
                valid_until, status, description, notes, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(quote.id)
        .bind(&quote.organization_id)
        .bind(quote.opportunity_id)
        .bind(quote.subcontractor_id)
        .bind(quote.amount)
        .bind(quote.quote_date)
        .bind(quote.valid_until)
        .bind(quote.status.as_str())
        .bind(&quote.description)
        .bind(&quote.notes)
        .bind(quote.created_at)
        .bind(quote.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(quote)
    }

    async fn get_quote(&self, id: Uuid) -> StoreResult<Option<Quote>> {
        let row = sqlx::query("SELECT * FROM quotes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| quote_from_row(&r)).transpose()
    }

    async fn list_quotes(&self, filter: &QuoteFilter) -> StoreResult<Vec<Quote>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM quotes
             WHERE ($1::uuid IS NULL OR opportunity_id = $1)
               AND ($2::uuid IS NULL OR subcontractor_id = $2)
               AND ($3::text IS NULL OR status = $3)
             ORDER BY quote_date DESC
            "#,
        )
        .bind(filter.opportunity_id)
        .bind(filter.subcontractor_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(quote_from_row).collect()
    }

    async fn update_quote(&self, id: Uuid, patch: &QuotePatch, at: DateTime<Utc>) -> StoreResult<Quote> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM quotes WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("quote", id))?;
        let mut quote = quote_from_row(&row)?;
        patch.apply(&mut quote);
        quote.updated_at = at;

        sqlx::query(
            r#"
            UPDATE quotes
               SET amount = $2,
                   quote_date = $3,
                   valid_until = $4,
                   status = $5,
                   description = $6,
                   notes = $7,
                   updated_at = $8
             WHERE id = $1
            "#,
        )
        .bind(quote.id)
        .bind(quote.amount)
        .bind(quote.quote_date)
        .bind(quote.valid_until)
        .bind(quote.status.as_str())
        .bind(&quote.description)
        .bind(&quote.notes)
        .bind(quote.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(quote)
    }

    async fn delete_quote(&self, id: Uuid) -> StoreResult<Quote> {
        let row = sqlx::query("DELETE FROM quotes WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("quote", id))?;
        quote_from_row(&row)
    }

    async fn insert_subcontractor(&self, sub: Subcontractor) -> StoreResult<Subcontractor> {
        sqlx::query(
            r#"
            INSERT INTO subcontractors (
                id, organization_id, company_name, duns, cage_code, uei, contact_name,
                email, phone, website, address, capabilities, certifications, naics_codes,
                sam_registered, notes, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(sub.id)
        .bind(&sub.organization_id)
        .bind(&sub.company_name)
        .bind(&sub.duns)
        .bind(&sub.cage_code)
        .bind(&sub.uei)
        .bind(&sub.contact_name)
        .bind(&sub.email)
        .bind(&sub.phone)
        .bind(&sub.website)
        .bind(&sub.address)
        .bind(&sub.capabilities)
        .bind(&sub.certifications)
        .bind(&sub.naics_codes)
        .bind(sub.sam_registered)
        .bind(&sub.notes)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn get_subcontractor(&self, id: Uuid) -> StoreResult<Option<Subcontractor>> {
        let row = sqlx::query("SELECT * FROM subcontractors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| subcontractor_from_row(&r)).transpose()
    }

    async fn list_subcontractors(&self, filter: &SubcontractorFilter) -> StoreResult<Vec<Subcontractor>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM subcontractors
             WHERE ($1::bool IS NULL OR sam_registered = $1)
               AND ($2::text IS NULL
                    OR company_name ILIKE $2 ESCAPE '\'
                    OR EXISTS (
                        SELECT 1 FROM unnest(capabilities || naics_codes) AS v
                         WHERE v ILIKE $2 ESCAPE '\'
                    ))
             ORDER BY lower(company_name) ASC
            "#,
        )
        .bind(filter.sam_registered)
        .bind(contains_pattern(filter.search.as_deref()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subcontractor_from_row).collect()
    }

    async fn update_subcontractor(
        &self,
        id: Uuid,
        patch: &SubcontractorPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Subcontractor> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM subcontractors WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("subcontractor", id))?;
        let mut sub = subcontractor_from_row(&row)?;
        patch.apply(&mut sub);
        sub.updated_at = at;

        sqlx::query(
            r#"
            UPDATE subcontractors
               SET company_name = $2,
                   duns = $3,
                   cage_code = $4,
                   uei = $5,
                   contact_name = $6,
                   email = $7,
                   phone = $8,
                   website = $9,
                   address = $10,
                   capabilities = $11,
                   certifications = $12,
                   naics_codes = $13,
                   sam_registered = $14,
                   notes = $15,
                   updated_at = $16
             WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(&sub.company_name)
        .bind(&sub.duns)
        .bind(&sub.cage_code)
        .bind(&sub.uei)
        .bind(&sub.contact_name)
        .bind(&sub.email)
        .bind(&sub.phone)
        .bind(&sub.website)
        .bind(&sub.address)
        .bind(&sub.capabilities)
        .bind(&sub.certifications)
        .bind(&sub.naics_codes)
        .bind(sub.sam_registered)
        .bind(&sub.notes)
        .bind(sub.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(sub)
    }

    async fn delete_subcontractor(&self, id: Uuid) -> StoreResult<Subcontractor> {
        let row = sqlx::query("DELETE FROM subcontractors WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("subcontractor", id))?;
        subcontractor_from_row(&row)
    }

    async fn add_team_member(&self, member: TeamMember) -> StoreResult<TeamMember> {
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM opportunities WHERE id = $1")
            .bind(member.opportunity_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("opportunity", member.opportunity_id));
        }
        sqlx::query(
            r#"
            INSERT INTO team_members (id, opportunity_id, user_id, role, assigned_by, assigned_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(member.id)
        .bind(member.opportunity_id)
        .bind(&member.user_id)
        .bind(&member.role)
        .bind(&member.assigned_by)
        .bind(member.assigned_at)
        .execute(&self.pool)
        .await
        .map_err(unique_as(ConflictKind::DuplicateTeamAssignment))?;
        Ok(member)
    }

    async fn list_team_members(&self, opportunity_id: Uuid) -> StoreResult<Vec<TeamMember>> {
        let rows = sqlx::query(
            "SELECT * FROM team_members WHERE opportunity_id = $1 ORDER BY assigned_at ASC",
        )
        .bind(opportunity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(team_member_from_row).collect()
    }

    async fn remove_team_member(&self, opportunity_id: Uuid, user_id: &str) -> StoreResult<TeamMember> {
        let row = sqlx::query(
            "DELETE FROM team_members WHERE opportunity_id = $1 AND user_id = $2 RETURNING *",
        )
        .bind(opportunity_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("team member", user_id))?;
        team_member_from_row(&row)
    }

    async fn list_activities(&self, filter: &ActivityFilter) -> StoreResult<Vec<Activity>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM activities
             WHERE ($1::text IS NULL OR entity_type = $1)
               AND ($2::uuid IS NULL OR entity_id = $2)
               AND ($3::text IS NULL OR activity_type = $3)
               AND ($4::uuid IS NULL OR opportunity_id = $4)
               AND ($5::uuid IS NULL OR contract_id = $5)
               AND ($6::uuid IS NULL OR subcontractor_id = $6)
             ORDER BY activity_date DESC
             LIMIT $7
            "#,
        )
        .bind(filter.entity_type.map(|t| t.as_str()))
        .bind(filter.entity_id)
        .bind(filter.activity_type.map(|t| t.as_str()))
        .bind(filter.opportunity_id)
        .bind(filter.contract_id)
        .bind(filter.subcontractor_id)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn delete_activity(&self, id: Uuid) -> StoreResult<Activity> {
        let row = sqlx::query("DELETE FROM activities WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("activity", id))?;
        activity_from_row(&row)
    }

    async fn insert_contact_log(&self, log: ContactLog) -> StoreResult<ContactLog> {
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM subcontractors WHERE id = $1")
            .bind(log.subcontractor_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("subcontractor", log.subcontractor_id));
        }
        sqlx::query(
            r#"
            INSERT INTO contact_logs (
                id, organization_id, subcontractor_id, opportunity_id, contact_type,
                summary, contacted_by, contact_date, follow_up_date
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id)
        .bind(&log.organization_id)
        .bind(log.subcontractor_id)
        .bind(log.opportunity_id)
        .bind(log.contact_type.as_str())
        .bind(&log.summary)
        .bind(&log.contacted_by)
        .bind(log.contact_date)
        .bind(log.follow_up_date)
        .execute(&self.pool)
        .await?;
        Ok(log)
    }

    async fn list_contact_logs(&self, subcontractor_id: Uuid) -> StoreResult<Vec<ContactLog>> {
        let rows = sqlx::query(
            "SELECT * FROM contact_logs WHERE subcontractor_id = $1 ORDER BY contact_date DESC",
        )
        .bind(subcontractor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contact_log_from_row).collect()
    }

    async fn delete_contact_log(&self, id: Uuid) -> StoreResult<ContactLog> {
        let row = sqlx::query("DELETE FROM contact_logs WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("contact log", id))?;
        contact_log_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("8(a)"), "8(a)");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like(r"C:\dir"), r"C:\\dir");
    }

    #[test]
    fn contains_pattern_wraps_escaped_text() {
        assert_eq!(contains_pattern(Some("a_b")).as_deref(), Some("%a\\_b%"));
        assert_eq!(contains_pattern(None), None);
    }
}
