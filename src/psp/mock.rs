use super::{CheckoutProvider, Order, PaymentRecord, PaymentStatus, PreferenceHandle};
use crate::error::{CheckoutError, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// In-memory stand-in for the hosted checkout. Honours idempotency keys the
/// way the real provider does and lets tests drive payment status changes.
#[derive(Default)]
pub struct MockProvider {
    preferences: Mutex<HashMap<String, PreferenceHandle>>,
    payments: Mutex<HashMap<String, PaymentRecord>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct preferences issued so far.
    pub fn preference_count(&self) -> usize {
        self.preferences.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Registers a payment attempt against an order, starting out pending.
    pub fn seed_payment(&self, order: &Order) -> PaymentRecord {
        let mut rng = rand::thread_rng();
        let id: u64 = rng.gen_range(1_000_000..10_000_000);
        let record = PaymentRecord {
            id: id.to_string(),
            status: PaymentStatus::Pending,
            provider_status: "pending".to_string(),
            status_detail: Some("pending_waiting_payment".to_string()),
            amount: order.total(),
            currency: order
                .items
                .first()
                .map(|i| i.currency.clone())
                .unwrap_or_default(),
            external_reference: Some(order.order_id.clone()),
            created_at: chrono::Utc::now(),
            approved_at: None,
            updated_at: None,
            provider: "Mock".to_string(),
        };
        if let Ok(mut payments) = self.payments.lock() {
            payments.insert(record.id.clone(), record.clone());
        }
        record
    }

    /// Moves a payment to `status` as the provider would. No state machine
    /// check here: the provider is the authority, observers judge.
    pub fn set_status(&self, payment_id: &str, status: PaymentStatus) -> Result<()> {
        let mut payments = self
            .payments
            .lock()
            .map_err(|_| CheckoutError::provider(None, "mock payment store poisoned"))?;
        let record = payments
            .get_mut(payment_id)
            .ok_or_else(|| CheckoutError::NotFound(payment_id.to_string()))?;
        let now = chrono::Utc::now();
        record.status = status;
        record.provider_status = status.as_str().to_string();
        record.updated_at = Some(now);
        if status == PaymentStatus::Approved {
            record.approved_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckoutProvider for MockProvider {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn create_preference(&self, order: &Order) -> Result<PreferenceHandle> {
        order.validate()?;

        let mut preferences = self
            .preferences
            .lock()
            .map_err(|_| CheckoutError::provider(None, "mock preference store poisoned"))?;
        if let Some(existing) = preferences.get(&order.idempotency_key) {
            debug!(key = %order.idempotency_key, "replaying preference for idempotency key");
            return Ok(existing.clone());
        }

        let suffix: u64 = rand::thread_rng().gen();
        let id = format!("mock-{}-{suffix:016x}", order.order_id);
        let handle = PreferenceHandle::new(
            id.clone(),
            &format!("https://sandbox.mercadopago.test/checkout/{id}"),
        )?;
        preferences.insert(order.idempotency_key.clone(), handle.clone());
        Ok(handle)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<PaymentRecord> {
        let payment_id = payment_id.trim();
        if payment_id.is_empty() {
            return Err(CheckoutError::Validation("payment id is empty".into()));
        }
        let payments = self
            .payments
            .lock()
            .map_err(|_| CheckoutError::provider(None, "mock payment store poisoned"))?;
        payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| CheckoutError::NotFound(payment_id.to_string()))
    }
}
