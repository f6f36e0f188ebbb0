//! PostgreSQL store built on sqlx.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prospect_core::{Prospect, ProtectedFields};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info_span, Instrument};

use crate::{ProspectStore, StoreError, WriteSet};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SELECT_COLUMNS: &str = r#"
    id, source_id, native_id, title, description, agency,
    place_city, place_state, place_country,
    naics, naics_description, naics_source,
    estimated_value_min, estimated_value_max, estimated_value_single,
    primary_contact_email, primary_contact_name,
    enriched_at, enrichment_model_version,
    extra, created_at, updated_at
"#;

const UNNEST_SOURCE: &str = r#"
    UNNEST(
        $1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[],
        $7::text[], $8::text[], $9::text[],
        $10::text[], $11::text[], $12::text[],
        $13::float8[], $14::float8[], $15::float8[],
        $16::text[], $17::text[],
        $18::timestamptz[], $19::text[],
        $20::text[], $21::timestamptz[], $22::timestamptz[]
    ) AS u(
        id, source_id, native_id, title, description, agency,
        place_city, place_state, place_country,
        naics, naics_description, naics_source,
        estimated_value_min, estimated_value_max, estimated_value_single,
        primary_contact_email, primary_contact_name,
        enriched_at, enrichment_model_version,
        extra, created_at, updated_at
    )
"#;

#[derive(Debug, Clone)]
pub struct PgProspectStore {
    pool: PgPool,
}

impl PgProspectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ProspectStore for PgProspectStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Prospect>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM prospects WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(prospect_from_row).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Prospect>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {SELECT_COLUMNS} FROM prospects WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prospect_from_row).collect()
    }

    async fn list_by_source(&self, source_id: &str) -> Result<Vec<Prospect>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM prospects WHERE source_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prospect_from_row).collect()
    }

    async fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let span = info_span!(
            "prospect_commit",
            inserts = writes.inserts.len(),
            updates = writes.updates.len()
        );

        async move {
            // Dropping `tx` on any early return rolls the whole write set back.
            let mut tx = self.pool.begin().await?;

            if !writes.inserts.is_empty() {
                let sql = format!(
                    r#"
                    INSERT INTO prospects (
                        id, source_id, native_id, title, description, agency,
                        place_city, place_state, place_country,
                        naics, naics_description, naics_source,
                        estimated_value_min, estimated_value_max, estimated_value_single,
                        primary_contact_email, primary_contact_name,
                        enriched_at, enrichment_model_version,
                        extra, created_at, updated_at
                    )
                    SELECT u.id, u.source_id, u.native_id, u.title, u.description, u.agency,
                           u.place_city, u.place_state, u.place_country,
                           u.naics, u.naics_description, u.naics_source,
                           u.estimated_value_min, u.estimated_value_max, u.estimated_value_single,
                           u.primary_contact_email, u.primary_contact_name,
                           u.enriched_at, u.enrichment_model_version,
                           u.extra::jsonb, u.created_at, u.updated_at
                      FROM {UNNEST_SOURCE}
                    "#
                );
                let columns = ProspectColumns::from_prospects(&writes.inserts)?;
                columns
                    .bind_all(sqlx::query(&sql))
                    .execute(&mut *tx)
                    .await
                    .map_err(map_unique_violation)?;
            }

            if !writes.updates.is_empty() {
                let sql = format!(
                    r#"
                    UPDATE prospects AS p
                       SET native_id = u.native_id,
                           title = u.title,
                           description = u.description,
                           agency = u.agency,
                           place_city = u.place_city,
                           place_state = u.place_state,
                           place_country = u.place_country,
                           naics = u.naics,
                           naics_description = u.naics_description,
                           naics_source = u.naics_source,
                           estimated_value_min = u.estimated_value_min,
                           estimated_value_max = u.estimated_value_max,
                           estimated_value_single = u.estimated_value_single,
                           primary_contact_email = u.primary_contact_email,
                           primary_contact_name = u.primary_contact_name,
                           enriched_at = u.enriched_at,
                           enrichment_model_version = u.enrichment_model_version,
                           extra = u.extra::jsonb,
                           updated_at = u.updated_at
                      FROM {UNNEST_SOURCE}
                     WHERE p.id = u.id
                    "#
                );
                let columns = ProspectColumns::from_prospects(&writes.updates)?;
                let affected = columns
                    .bind_all(sqlx::query(&sql))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if affected != writes.updates.len() as u64 {
                    let present = sqlx::query("SELECT id FROM prospects WHERE id = ANY($1)")
                        .bind(writes.updates.iter().map(|p| p.id.clone()).collect::<Vec<_>>())
                        .fetch_all(&mut *tx)
                        .await?
                        .into_iter()
                        .map(|row| row.try_get::<String, _>("id"))
                        .collect::<Result<Vec<_>, _>>()?;
                    let missing = writes
                        .updates
                        .iter()
                        .find(|p| !present.contains(&p.id))
                        .map(|p| p.id.clone())
                        .unwrap_or_default();
                    return Err(StoreError::MissingProspect(missing));
                }
            }

            tx.commit().await?;
            debug!("write set committed");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            let detail = db_err.message().to_string();
            return StoreError::DuplicateId(detail);
        }
    }
    StoreError::Database(err)
}

fn prospect_from_row(row: &PgRow) -> Result<Prospect, StoreError> {
    let id: String = row.try_get("id")?;
    let extra: serde_json::Value = row.try_get("extra")?;
    let extra = match extra {
        serde_json::Value::Object(map) => map.into_iter().collect::<BTreeMap<_, _>>(),
        _ => BTreeMap::new(),
    };
    Ok(Prospect {
        source_id: row.try_get("source_id")?,
        native_id: row.try_get("native_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        agency: row.try_get("agency")?,
        place_city: row.try_get("place_city")?,
        place_state: row.try_get("place_state")?,
        place_country: row.try_get("place_country")?,
        protected: ProtectedFields {
            naics: row.try_get("naics")?,
            naics_description: row.try_get("naics_description")?,
            naics_source: row.try_get("naics_source")?,
            estimated_value_min: row.try_get("estimated_value_min")?,
            estimated_value_max: row.try_get("estimated_value_max")?,
            estimated_value_single: row.try_get("estimated_value_single")?,
            primary_contact_email: row.try_get("primary_contact_email")?,
            primary_contact_name: row.try_get("primary_contact_name")?,
            enriched_at: row.try_get("enriched_at")?,
            enrichment_model_version: row.try_get("enrichment_model_version")?,
        },
        extra,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}

/// Column-major view of a slice of prospects, bound as `UNNEST` arrays.
#[derive(Default)]
struct ProspectColumns {
    id: Vec<String>,
    source_id: Vec<String>,
    native_id: Vec<Option<String>>,
    title: Vec<Option<String>>,
    description: Vec<Option<String>>,
    agency: Vec<Option<String>>,
    place_city: Vec<Option<String>>,
    place_state: Vec<Option<String>>,
    place_country: Vec<Option<String>>,
    naics: Vec<Option<String>>,
    naics_description: Vec<Option<String>>,
    naics_source: Vec<Option<String>>,
    estimated_value_min: Vec<Option<f64>>,
    estimated_value_max: Vec<Option<f64>>,
    estimated_value_single: Vec<Option<f64>>,
    primary_contact_email: Vec<Option<String>>,
    primary_contact_name: Vec<Option<String>>,
    enriched_at: Vec<Option<DateTime<Utc>>>,
    enrichment_model_version: Vec<Option<String>>,
    extra: Vec<String>,
    created_at: Vec<DateTime<Utc>>,
    updated_at: Vec<DateTime<Utc>>,
}

impl ProspectColumns {
    fn from_prospects(prospects: &[Prospect]) -> Result<Self, StoreError> {
        let mut cols = Self::default();
        for p in prospects {
            let extra = serde_json::to_string(&p.extra).map_err(|source| StoreError::Encode {
                id: p.id.clone(),
                source,
            })?;
            cols.id.push(p.id.clone());
            cols.source_id.push(p.source_id.clone());
            cols.native_id.push(p.native_id.clone());
            cols.title.push(p.title.clone());
            cols.description.push(p.description.clone());
            cols.agency.push(p.agency.clone());
            cols.place_city.push(p.place_city.clone());
            cols.place_state.push(p.place_state.clone());
            cols.place_country.push(p.place_country.clone());
            cols.naics.push(p.protected.naics.clone());
            cols.naics_description.push(p.protected.naics_description.clone());
            cols.naics_source.push(p.protected.naics_source.clone());
            cols.estimated_value_min.push(p.protected.estimated_value_min);
            cols.estimated_value_max.push(p.protected.estimated_value_max);
            cols.estimated_value_single.push(p.protected.estimated_value_single);
            cols.primary_contact_email.push(p.protected.primary_contact_email.clone());
            cols.primary_contact_name.push(p.protected.primary_contact_name.clone());
            cols.enriched_at.push(p.protected.enriched_at);
            cols.enrichment_model_version
                .push(p.protected.enrichment_model_version.clone());
            cols.extra.push(extra);
            cols.created_at.push(p.created_at);
            cols.updated_at.push(p.updated_at);
        }
        Ok(cols)
    }

    fn bind_all<'q>(
        self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        query
            .bind(self.id)
            .bind(self.source_id)
            .bind(self.native_id)
            .bind(self.title)
            .bind(self.description)
            .bind(self.agency)
            .bind(self.place_city)
            .bind(self.place_state)
            .bind(self.place_country)
            .bind(self.naics)
            .bind(self.naics_description)
            .bind(self.naics_source)
            .bind(self.estimated_value_min)
            .bind(self.estimated_value_max)
            .bind(self.estimated_value_single)
            .bind(self.primary_contact_email)
            .bind(self.primary_contact_name)
            .bind(self.enriched_at)
            .bind(self.enrichment_model_version)
            .bind(self.extra)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}
