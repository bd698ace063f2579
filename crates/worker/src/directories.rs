//! Postgres-backed customer and contact directories.
//!
//! Insert-or-fetch on the `(tenant_id, external_ref)` uniqueness
//! constraint, so a retried saga step always lands on the record the
//! first attempt created.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use common::{ContactId, CustomerId, TenantId};
use conversion::{
    ContactDirectory, ContactRecord, CustomerDirectory, CustomerRecord, NewContact, NewCustomer,
};
use domain::StepError;

fn db_error(err: sqlx::Error) -> StepError {
    StepError::transient(format!("directory database error: {err}"))
}

fn row_to_customer(row: &PgRow) -> Result<CustomerRecord, sqlx::Error> {
    Ok(CustomerRecord {
        id: CustomerId::from_uuid(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        external_ref: row.try_get("external_ref")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn row_to_contact(row: &PgRow) -> Result<ContactRecord, sqlx::Error> {
    Ok(ContactRecord {
        id: ContactId::from_uuid(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        customer_id: CustomerId::from_uuid(row.try_get::<Uuid, _>("customer_id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        external_ref: row.try_get("external_ref")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

pub struct PgCustomerDirectory {
    pool: PgPool,
}

impl PgCustomerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerDirectory for PgCustomerDirectory {
    async fn create_if_absent(&self, customer: NewCustomer) -> Result<CustomerRecord, StepError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO customers (id, tenant_id, name, email, external_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, external_ref) DO NOTHING
            RETURNING id, tenant_id, name, email, external_ref, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer.tenant_id.as_uuid())
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(&customer.external_ref)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let row = match inserted {
            Some(row) => row,
            // Lost the insert race; the existing record wins.
            None => sqlx::query(
                r#"
                SELECT id, tenant_id, name, email, external_ref, created_at
                FROM customers
                WHERE tenant_id = $1 AND external_ref = $2
                "#,
            )
            .bind(customer.tenant_id.as_uuid())
            .bind(&customer.external_ref)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?,
        };
        row_to_customer(&row).map_err(db_error)
    }

    async fn exists(&self, tenant_id: TenantId, id: CustomerId) -> Result<bool, StepError> {
        let row = sqlx::query("SELECT 1 FROM customers WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.is_some())
    }
}

pub struct PgContactDirectory {
    pool: PgPool,
}

impl PgContactDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for PgContactDirectory {
    async fn create_if_absent(&self, contact: NewContact) -> Result<ContactRecord, StepError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO contacts (id, tenant_id, customer_id, name, email, external_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, external_ref) DO NOTHING
            RETURNING id, tenant_id, customer_id, name, email, external_ref, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(contact.tenant_id.as_uuid())
        .bind(contact.customer_id.as_uuid())
        .bind(&contact.name)
        .bind(&contact.email)
        .bind(&contact.external_ref)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query(
                r#"
                SELECT id, tenant_id, customer_id, name, email, external_ref, created_at
                FROM contacts
                WHERE tenant_id = $1 AND external_ref = $2
                "#,
            )
            .bind(contact.tenant_id.as_uuid())
            .bind(&contact.external_ref)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?,
        };
        row_to_contact(&row).map_err(db_error)
    }

    async fn delete(&self, tenant_id: TenantId, id: ContactId) -> Result<(), StepError> {
        sqlx::query("DELETE FROM contacts WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}
