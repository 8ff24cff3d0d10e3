pub mod mercadopago;
pub mod mock;
pub mod notification;

use crate::error::{CheckoutError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;

/// A single purchasable line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    /// ISO 4217 code, e.g. `ARS`.
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Payer {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Where the provider sends the user back after checkout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackUrls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<String>,
}

impl BackUrls {
    fn is_empty(&self) -> bool {
        self.success.is_none() && self.failure.is_none() && self.pending.is_none()
    }

    /// Fills unset entries from `defaults`.
    pub fn or(self, defaults: &BackUrls) -> BackUrls {
        BackUrls {
            success: self.success.or_else(|| defaults.success.clone()),
            failure: self.failure.or_else(|| defaults.failure.clone()),
            pending: self.pending.or_else(|| defaults.pending.clone()),
        }
    }
}

/// Request side of a checkout preference. Immutable once issued: a changed
/// order gets a new `Order` with a new idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<Payer>,
    #[serde(default, skip_serializing_if = "BackUrls::is_empty")]
    pub back_urls: BackUrls,
    pub idempotency_key: String,
}

impl Order {
    /// Checks everything the provider would reject, before any request is made.
    pub fn validate(&self) -> Result<()> {
        if self.order_id.trim().is_empty() {
            return Err(CheckoutError::Validation("order_id is empty".into()));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(CheckoutError::Validation(format!(
                "order {} has an empty idempotency key",
                self.order_id
            )));
        }
        let Some(first) = self.items.first() else {
            return Err(CheckoutError::Validation(format!(
                "order {} has no line items",
                self.order_id
            )));
        };

        for (idx, item) in self.items.iter().enumerate() {
            if item.description.trim().is_empty() {
                return Err(CheckoutError::Validation(format!(
                    "item {idx}: description is empty"
                )));
            }
            if item.unit_price <= Decimal::ZERO {
                return Err(CheckoutError::Validation(format!(
                    "item {idx}: unit price must be positive, got {}",
                    item.unit_price
                )));
            }
            if item.quantity == 0 {
                return Err(CheckoutError::Validation(format!(
                    "item {idx}: quantity must be positive"
                )));
            }
            if item.currency.len() != 3 || !item.currency.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(CheckoutError::Validation(format!(
                    "item {idx}: invalid currency code {:?}",
                    item.currency
                )));
            }
            if item.currency != first.currency {
                return Err(CheckoutError::Validation(format!(
                    "item {idx}: currency {} differs from {}",
                    item.currency, first.currency
                )));
            }
        }

        for url in [
            &self.back_urls.success,
            &self.back_urls.failure,
            &self.back_urls.pending,
        ]
        .into_iter()
        .flatten()
        {
            Url::parse(url).map_err(|e| {
                CheckoutError::Validation(format!("invalid back url {url:?}: {e}"))
            })?;
        }

        Ok(())
    }

    pub fn total(&self) -> Decimal {
        self.items
            .iter()
            .map(|i| i.unit_price * Decimal::from(i.quantity))
            .sum()
    }
}

/// What the caller gets back from a successful preference creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceHandle {
    pub preference_id: String,
    pub redirect_url: Url,
}

impl PreferenceHandle {
    /// Builds a handle, insisting on an https redirect and a non-empty id.
    pub fn new(preference_id: String, redirect_url: &str) -> Result<Self> {
        if preference_id.trim().is_empty() {
            return Err(CheckoutError::provider(None, "provider returned an empty preference id"));
        }
        let redirect_url = Url::parse(redirect_url).map_err(|e| {
            CheckoutError::provider(None, format!("malformed redirect url {redirect_url:?}: {e}"))
        })?;
        if redirect_url.scheme() != "https" {
            return Err(CheckoutError::provider(
                None,
                format!("redirect url is not https: {redirect_url}"),
            ));
        }
        Ok(Self {
            preference_id,
            redirect_url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    /// Maps the provider's status vocabulary onto ours. Unknown values are
    /// treated as still pending.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "approved" | "in_mediation" => Self::Approved,
            "rejected" => Self::Rejected,
            "cancelled" => Self::Cancelled,
            "refunded" | "charged_back" => Self::Refunded,
            _ => Self::Pending,
        }
    }

    /// Settled one way or the other. An approved payment can still be refunded.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// No further transition is possible.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Rejected | Self::Refunded | Self::Cancelled)
    }

    /// pending -> {approved, rejected, cancelled}, approved -> refunded.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled) | (Approved, Refunded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only copy of the provider's record for one payment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub status: PaymentStatus,
    pub provider_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub provider: String,
}

#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn create_preference(&self, order: &Order) -> Result<PreferenceHandle>;
    async fn get_payment(&self, payment_id: &str) -> Result<PaymentRecord>;
}
