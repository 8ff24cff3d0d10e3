use super::{CheckoutProvider, Order, PaymentRecord, PaymentStatus, PreferenceHandle};
use crate::config::ClientConfig;
use crate::error::{CheckoutError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Mercado Pago REST client. Cheap to clone; every clone shares the same
/// connection pool and immutable configuration.
#[derive(Clone, Debug)]
pub struct MercadoPagoClient {
    config: Arc<ClientConfig>,
    preferences_url: Url,
    payments_url: Url,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PreferenceRequest<'a> {
    items: Vec<PreferenceItem<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<PreferencePayer<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    back_urls: Option<PreferenceBackUrls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_return: Option<&'static str>,
    external_reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    statement_descriptor: Option<&'a str>,
}

#[derive(Serialize)]
struct PreferenceItem<'a> {
    title: &'a str,
    quantity: u32,
    #[serde(with = "rust_decimal::serde::float")]
    unit_price: Decimal,
    currency_id: &'a str,
}

#[derive(Serialize)]
struct PreferencePayer<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct PreferenceBackUrls {
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending: Option<String>,
}

#[derive(Deserialize)]
struct PreferenceResponse {
    id: String,
    #[serde(default)]
    init_point: Option<String>,
    #[serde(default)]
    sandbox_init_point: Option<String>,
}

#[derive(Deserialize)]
struct MpPayment {
    id: serde_json::Value,
    status: String,
    #[serde(default)]
    status_detail: Option<String>,
    transaction_amount: Decimal,
    currency_id: String,
    #[serde(default)]
    external_reference: Option<String>,
    date_created: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    date_approved: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    date_last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize)]
struct MpErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl MercadoPagoClient {
    /// Validates `config` and builds the HTTP client. No request is made here.
    pub fn configure(config: ClientConfig) -> Result<Self> {
        let mut base = Url::parse(&config.api_base_url).map_err(|e| {
            CheckoutError::Configuration(format!(
                "invalid api base url {:?}: {e}",
                config.api_base_url
            ))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let preferences_url = base.join("checkout/preferences").map_err(|e| {
            CheckoutError::Configuration(format!("failed to construct preferences url: {e}"))
        })?;
        let payments_url = base.join("v1/payments/").map_err(|e| {
            CheckoutError::Configuration(format!("failed to construct payments url: {e}"))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                CheckoutError::Configuration(format!("failed to build http client: {e}"))
            })?;

        debug!(?config, "payment client configured");

        Ok(Self {
            config: Arc::new(config),
            preferences_url,
            payments_url,
            client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[instrument(
        name = "mercadopago.create_preference",
        skip_all,
        fields(order_id = %order.order_id, idempotency_key = %order.idempotency_key),
        err
    )]
    pub async fn create_preference(&self, order: &Order) -> Result<PreferenceHandle> {
        order.validate()?;

        let idempotency_key = self.config.scoped_idempotency_key(&order.idempotency_key);
        let body = self.preference_request(order);

        let created: PreferenceResponse = self
            .config
            .retry
            .run("POST /checkout/preferences", || async {
                let resp = self
                    .client
                    .post(self.preferences_url.clone())
                    .bearer_auth(self.config.access_token())
                    .header("X-Idempotency-Key", &idempotency_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;
                self.decode(resp).await
            })
            .await?;

        let redirect = if self.config.sandbox {
            created.sandbox_init_point.or(created.init_point)
        } else {
            created.init_point.or(created.sandbox_init_point)
        };
        let redirect = redirect.ok_or_else(|| {
            CheckoutError::provider(None, format!("preference {} has no init point", created.id))
        })?;

        let handle = PreferenceHandle::new(created.id, &redirect)?;
        info!(preference_id = %handle.preference_id, total = %order.total(), "preference created");
        Ok(handle)
    }

    #[instrument(name = "mercadopago.get_payment", skip(self), err)]
    pub async fn get_payment(&self, payment_id: &str) -> Result<PaymentRecord> {
        let payment_id = payment_id.trim();
        let url = self.payment_url(payment_id)?;

        let result = self
            .config
            .retry
            .run("GET /v1/payments", || async {
                let resp = self
                    .client
                    .get(url.clone())
                    .bearer_auth(self.config.access_token())
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;
                self.decode::<MpPayment>(resp).await
            })
            .await;

        let payment = match result {
            Ok(p) => p,
            Err(CheckoutError::Provider {
                status: Some(404), ..
            }) => return Err(CheckoutError::NotFound(payment_id.to_string())),
            Err(e) => return Err(e),
        };

        let id = match payment.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let status = PaymentStatus::from_provider(&payment.status);
        debug!(%id, %status, provider_status = %payment.status, "payment fetched");

        Ok(PaymentRecord {
            id,
            status,
            provider_status: payment.status,
            status_detail: payment.status_detail,
            amount: payment.transaction_amount,
            currency: payment.currency_id,
            external_reference: payment.external_reference,
            created_at: payment.date_created,
            approved_at: payment.date_approved,
            updated_at: payment.date_last_updated,
            provider: "MercadoPago".to_string(),
        })
    }

    /// Provider payment ids are numeric. Anything else is refused before the
    /// token-bearing request is built, and the id only ever fills one path
    /// segment under `/v1/payments/`.
    fn payment_url(&self, payment_id: &str) -> Result<Url> {
        if payment_id.is_empty() {
            return Err(CheckoutError::Validation("payment id is empty".into()));
        }
        if !payment_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CheckoutError::Validation(format!(
                "invalid payment id {payment_id:?}: expected digits only"
            )));
        }
        let mut url = self.payments_url.clone();
        url.path_segments_mut()
            .map_err(|_| CheckoutError::Configuration("api base url cannot hold a path".into()))?
            .pop_if_empty()
            .push(payment_id);
        Ok(url)
    }

    fn preference_request<'a>(&'a self, order: &'a Order) -> PreferenceRequest<'a> {
        let back_urls = order.back_urls.clone().or(&self.config.back_urls);
        let auto_return = back_urls.success.as_ref().map(|_| "approved");
        let has_back_urls = back_urls.success.is_some()
            || back_urls.failure.is_some()
            || back_urls.pending.is_some();

        PreferenceRequest {
            items: order
                .items
                .iter()
                .map(|item| PreferenceItem {
                    title: &item.description,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    currency_id: &item.currency,
                })
                .collect(),
            payer: order.payer.as_ref().map(|p| PreferencePayer {
                email: &p.email,
                name: p.name.as_deref(),
            }),
            back_urls: has_back_urls.then(|| PreferenceBackUrls {
                success: back_urls.success,
                failure: back_urls.failure,
                pending: back_urls.pending,
            }),
            auto_return,
            external_reference: &order.order_id,
            notification_url: self.config.notification_url.as_deref(),
            statement_descriptor: self.config.statement_descriptor.as_deref(),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> CheckoutError {
        if e.is_timeout() {
            CheckoutError::Timeout {
                timeout_ms: self.config.timeout.as_millis() as u64,
            }
        } else {
            CheckoutError::provider(e.status().map(|s| s.as_u16()), e.to_string())
        }
    }

    async fn decode<R>(&self, resp: reqwest::Response) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<R>().await.map_err(|e| {
                if e.is_timeout() {
                    self.transport_error(e)
                } else {
                    CheckoutError::provider(
                        Some(status.as_u16()),
                        format!("unexpected response body: {e}"),
                    )
                }
            });
        }

        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(status = status.as_u16(), error = %e, "failed to read error body");
                String::new()
            }
        };
        let message = serde_json::from_str::<MpErrorBody>(&text)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.canonical_reason().unwrap_or("unknown error").to_string()
                } else {
                    text.clone()
                }
            });
        if status != StatusCode::NOT_FOUND {
            warn!(status = status.as_u16(), %message, "provider rejected request");
        }
        Err(CheckoutError::provider(Some(status.as_u16()), message))
    }
}

#[async_trait]
impl CheckoutProvider for MercadoPagoClient {
    fn name(&self) -> &str {
        "MercadoPago"
    }

    async fn create_preference(&self, order: &Order) -> Result<PreferenceHandle> {
        MercadoPagoClient::create_preference(self, order).await
    }

    async fn get_payment(&self, payment_id: &str) -> Result<PaymentRecord> {
        MercadoPagoClient::get_payment(self, payment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psp::tests::course_fee_order;
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use wiremock::matchers::{bearer_token, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, retry: RetryPolicy) -> MercadoPagoClient {
        let config = ClientConfig::new("TEST-token", 2_000, None)
            .unwrap()
            .with_base_url(server.uri())
            .with_retry(retry);
        MercadoPagoClient::configure(config).unwrap()
    }

    fn preference_body(id: &str) -> serde_json::Value {
        let redirect = "checkout/v1/redirect?pref_id=";
        serde_json::json!({
            "id": id,
            "init_point": format!("https://www.mercadopago.com.ar/{redirect}{id}"),
            "sandbox_init_point": format!("https://sandbox.mercadopago.com.ar/{redirect}{id}"),
            "date_created": "2026-03-01T10:00:00.000-03:00"
        })
    }

    fn payment_body(id: u64, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "status": status,
            "status_detail": "accredited",
            "transaction_amount": 1000.0,
            "currency_id": "ARS",
            "external_reference": "42",
            "date_created": "2026-03-01T10:05:00.000-03:00",
            "date_approved": "2026-03-01T10:06:00.000-03:00",
            "date_last_updated": "2026-03-01T10:06:00.000-03:00"
        })
    }

    #[tokio::test]
    async fn creates_preference_and_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .and(bearer_token("TEST-token"))
            .and(header("X-Idempotency-Key", "order-42"))
            .and(body_partial_json(serde_json::json!({
                "external_reference": "42",
                "items": [{
                    "title": "Course fee",
                    "quantity": 1,
                    "unit_price": 1000.0,
                    "currency_id": "ARS"
                }]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(preference_body("123-abc")))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let order = course_fee_order("order-42");

        let first = client.create_preference(&order).await.unwrap();
        assert_eq!(first.preference_id, "123-abc");
        assert_eq!(first.redirect_url.scheme(), "https");
        assert_eq!(first.redirect_url.host_str(), Some("sandbox.mercadopago.com.ar"));

        let second = client.create_preference(&order).await.unwrap();
        assert_eq!(second.preference_id, first.preference_id);
    }

    #[tokio::test]
    async fn production_mode_uses_init_point() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .respond_with(ResponseTemplate::new(201).set_body_json(preference_body("prod-1")))
            .mount(&server)
            .await;

        let config = ClientConfig::new("TEST-token", 2_000, Some("agenda".into()))
            .unwrap()
            .with_base_url(server.uri())
            .with_sandbox(false);
        let client = MercadoPagoClient::configure(config).unwrap();
        let handle = client.create_preference(&course_fee_order("order-1")).await.unwrap();
        assert_eq!(handle.redirect_url.host_str(), Some("www.mercadopago.com.ar"));
    }

    #[tokio::test]
    async fn namespaced_idempotency_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Idempotency-Key", "agenda:order-7"))
            .respond_with(ResponseTemplate::new(201).set_body_json(preference_body("ns-1")))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new("TEST-token", 2_000, Some("agenda".into()))
            .unwrap()
            .with_base_url(server.uri());
        let client = MercadoPagoClient::configure(config).unwrap();
        client.create_preference(&course_fee_order("order-7")).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_order_never_hits_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(preference_body("x")))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::default());
        let mut order = course_fee_order("order-42");
        order.items[0].quantity = 0;
        let err = client.create_preference(&order).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));

        order.items.clear();
        let err = client.create_preference(&order).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));
    }

    #[tokio::test]
    async fn provider_rejection_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "message": "invalid items.unit_price",
                "error": "bad_request",
                "status": 400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::default());
        let err = client
            .create_preference(&course_fee_order("order-42"))
            .await
            .unwrap_err();
        match err {
            CheckoutError::Provider { status, message } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "invalid items.unit_price");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_transient_failure_with_same_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Idempotency-Key", "order-42"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("X-Idempotency-Key", "order-42"))
            .respond_with(ResponseTemplate::new(201).set_body_json(preference_body("retry-1")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(
            &server,
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 5,
            },
        );
        let handle = client
            .create_preference(&course_fee_order("order-42"))
            .await
            .unwrap();
        assert_eq!(handle.preference_id, "retry-1");
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(preference_body("late"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let config = ClientConfig::new("TEST-token", 50, None)
            .unwrap()
            .with_base_url(server.uri())
            .with_retry(RetryPolicy::none());
        let client = MercadoPagoClient::configure(config).unwrap();
        let err = client
            .create_preference(&course_fee_order("order-42"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn fetches_payment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/987654"))
            .and(bearer_token("TEST-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(payment_body(987654, "approved")),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let record = client.get_payment("987654").await.unwrap();
        assert_eq!(record.id, "987654");
        assert_eq!(record.status, PaymentStatus::Approved);
        assert_eq!(record.provider_status, "approved");
        assert_eq!(record.amount, Decimal::from(1000));
        assert_eq!(record.currency, "ARS");
        assert_eq!(record.external_reference.as_deref(), Some("42"));
        assert!(record.approved_at.is_some());
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "message": "Payment not found",
                "error": "not_found",
                "status": 404
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::default());
        let err = client.get_payment("1").await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound(ref id) if id == "1"));
    }

    #[tokio::test]
    async fn blank_payment_id_is_rejected_locally() {
        let server = MockServer::start().await;
        let client = client_for(&server, RetryPolicy::none());
        assert!(matches!(
            client.get_payment("  ").await,
            Err(CheckoutError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn url_shaped_payment_ids_never_leave_the_client() {
        let api = MockServer::start().await;
        let elsewhere = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payment_body(1, "approved")))
            .expect(0)
            .mount(&api)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payment_body(1, "approved")))
            .expect(0)
            .mount(&elsewhere)
            .await;

        let client = client_for(&api, RetryPolicy::none());
        let hostile = [
            format!("{}/steal", elsewhere.uri()),
            "//evil.example/x".to_string(),
            "../../checkout/preferences".to_string(),
            "123?access_token=x".to_string(),
            "123#frag".to_string(),
            "12%2F3".to_string(),
            "123/456".to_string(),
        ];
        for id in hostile {
            let err = client.get_payment(&id).await.unwrap_err();
            assert!(
                matches!(err, CheckoutError::Validation(_)),
                "{id:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn payment_id_fills_a_single_segment() {
        let config = ClientConfig::new("TEST-token", 1000, None)
            .unwrap()
            .with_base_url("https://api.example/mp");
        let client = MercadoPagoClient::configure(config).unwrap();
        let url = client.payment_url("987654").unwrap();
        assert_eq!(url.as_str(), "https://api.example/mp/v1/payments/987654");
    }

    #[tokio::test]
    async fn timeout_is_not_retried_and_stays_within_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(preference_body("late"))
                    .set_delay(Duration::from_secs(2)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new("TEST-token", 100, None)
            .unwrap()
            .with_base_url(server.uri());
        assert!(config.retry.max_retries > 0);
        let client = MercadoPagoClient::configure(config).unwrap();

        let started = std::time::Instant::now();
        let err = client
            .create_preference(&course_fee_order("order-42"))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, CheckoutError::Timeout { timeout_ms: 100 }));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    }

    #[test]
    fn bad_base_url_is_a_configuration_error() {
        let config = ClientConfig::new("TEST-token", 1000, None)
            .unwrap()
            .with_base_url("not a url");
        assert!(matches!(
            MercadoPagoClient::configure(config),
            Err(CheckoutError::Configuration(_))
        ));
    }
}
