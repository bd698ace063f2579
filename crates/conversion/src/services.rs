//! External directories the saga steps call.
//!
//! Customers and contacts live in their own services; the saga reaches
//! them through these traits. Every creating call carries an external
//! reference (the saga ID) so a retried step lands on the record the
//! first attempt made instead of creating a second one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use common::{ContactId, CustomerId, TenantId};
use domain::StepError;

/// A customer as known to the customer directory.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRecord {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub name: String,
    pub email: Option<String>,
    /// Reference supplied by the creator, used for deduplication.
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a customer.
#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub tenant_id: TenantId,
    pub name: String,
    pub email: Option<String>,
    pub external_ref: String,
}

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    /// Creates a customer unless one with the same external reference
    /// already exists, in which case that record is returned.
    async fn create_if_absent(&self, customer: NewCustomer) -> Result<CustomerRecord, StepError>;

    /// Checks that a customer exists for the tenant.
    async fn exists(&self, tenant_id: TenantId, id: CustomerId) -> Result<bool, StepError>;
}

/// A contact as known to the contact directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub name: String,
    pub email: String,
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a contact.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub name: String,
    pub email: String,
    pub external_ref: String,
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Creates a contact unless one with the same external reference
    /// already exists, in which case that record is returned.
    async fn create_if_absent(&self, contact: NewContact) -> Result<ContactRecord, StepError>;

    /// Removes a contact. A missing contact is not an error, so a
    /// compensation can re-run safely.
    async fn delete(&self, tenant_id: TenantId, id: ContactId) -> Result<(), StepError>;
}

#[derive(Default)]
struct CustomerDirState {
    customers: HashMap<Uuid, CustomerRecord>,
    by_ref: HashMap<String, Uuid>,
    failures: VecDeque<StepError>,
}

/// In-memory customer directory for tests.
#[derive(Clone, Default)]
pub struct MemoryCustomerDirectory {
    state: Arc<RwLock<CustomerDirState>>,
}

impl MemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `times` copies of `error`; each subsequent directory
    /// call consumes one and fails with it.
    pub async fn fail_with(&self, error: StepError, times: usize) {
        let mut state = self.state.write().await;
        for _ in 0..times {
            state.failures.push_back(error.clone());
        }
    }

    /// Registers an existing customer so lookups can find it.
    pub async fn insert(&self, record: CustomerRecord) {
        let mut state = self.state.write().await;
        state.by_ref.insert(record.external_ref.clone(), record.id.as_uuid());
        state.customers.insert(record.id.as_uuid(), record);
    }

    /// All customer records, for assertions.
    pub async fn records(&self) -> Vec<CustomerRecord> {
        self.state.read().await.customers.values().cloned().collect()
    }
}

#[async_trait]
impl CustomerDirectory for MemoryCustomerDirectory {
    async fn create_if_absent(&self, customer: NewCustomer) -> Result<CustomerRecord, StepError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if let Some(id) = state.by_ref.get(&customer.external_ref)
            && let Some(existing) = state.customers.get(id)
        {
            return Ok(existing.clone());
        }
        let record = CustomerRecord {
            id: CustomerId::new(),
            tenant_id: customer.tenant_id,
            name: customer.name,
            email: customer.email,
            external_ref: customer.external_ref.clone(),
            created_at: Utc::now(),
        };
        state.by_ref.insert(customer.external_ref, record.id.as_uuid());
        state.customers.insert(record.id.as_uuid(), record.clone());
        Ok(record)
    }

    async fn exists(&self, tenant_id: TenantId, id: CustomerId) -> Result<bool, StepError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        Ok(state
            .customers
            .get(&id.as_uuid())
            .is_some_and(|c| c.tenant_id == tenant_id))
    }
}

#[derive(Default)]
struct ContactDirState {
    contacts: HashMap<Uuid, ContactRecord>,
    by_ref: HashMap<String, Uuid>,
    create_failures: VecDeque<StepError>,
    delete_failures: VecDeque<StepError>,
}

/// In-memory contact directory for tests. Create and delete failures
/// are injected separately so a compensation failure can be staged
/// after a successful apply.
#[derive(Clone, Default)]
pub struct MemoryContactDirectory {
    state: Arc<RwLock<ContactDirState>>,
}

impl MemoryContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_create_with(&self, error: StepError, times: usize) {
        let mut state = self.state.write().await;
        for _ in 0..times {
            state.create_failures.push_back(error.clone());
        }
    }

    pub async fn fail_delete_with(&self, error: StepError, times: usize) {
        let mut state = self.state.write().await;
        for _ in 0..times {
            state.delete_failures.push_back(error.clone());
        }
    }

    /// All contact records, for assertions.
    pub async fn records(&self) -> Vec<ContactRecord> {
        self.state.read().await.contacts.values().cloned().collect()
    }
}

#[async_trait]
impl ContactDirectory for MemoryContactDirectory {
    async fn create_if_absent(&self, contact: NewContact) -> Result<ContactRecord, StepError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if let Some(id) = state.by_ref.get(&contact.external_ref)
            && let Some(existing) = state.contacts.get(id)
        {
            return Ok(existing.clone());
        }
        let record = ContactRecord {
            id: ContactId::new(),
            tenant_id: contact.tenant_id,
            customer_id: contact.customer_id,
            name: contact.name,
            email: contact.email,
            external_ref: contact.external_ref.clone(),
            created_at: Utc::now(),
        };
        state.by_ref.insert(contact.external_ref, record.id.as_uuid());
        state.contacts.insert(record.id.as_uuid(), record.clone());
        Ok(record)
    }

    async fn delete(&self, _tenant_id: TenantId, id: ContactId) -> Result<(), StepError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }
        if let Some(record) = state.contacts.remove(&id.as_uuid()) {
            state.by_ref.remove(&record.external_ref);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_if_absent_dedupes_on_external_ref() {
        let directory = MemoryCustomerDirectory::new();
        let new = NewCustomer {
            tenant_id: TenantId::new(),
            name: "Acme Corp".into(),
            email: None,
            external_ref: "saga-1".into(),
        };
        let first = directory.create_if_absent(new.clone()).await.unwrap();
        let second = directory.create_if_absent(new).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(directory.records().await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let directory = MemoryCustomerDirectory::new();
        directory
            .fail_with(StepError::transient("directory down"), 1)
            .await;
        let new = NewCustomer {
            tenant_id: TenantId::new(),
            name: "Acme Corp".into(),
            email: None,
            external_ref: "saga-1".into(),
        };
        assert!(directory.create_if_absent(new.clone()).await.is_err());
        assert!(directory.create_if_absent(new).await.is_ok());
    }

    #[tokio::test]
    async fn contact_delete_tolerates_missing_record() {
        let directory = MemoryContactDirectory::new();
        directory
            .delete(TenantId::new(), ContactId::new())
            .await
            .unwrap();
    }
}
