//! LND REST-backed Lightning collaborator (§1 "the Lightning node RPC
//! client"; §4.F [`swap_node_core::lightning::LnAdapter`]).
//!
//! Subscriptions are polling-based rather than consuming LND's streaming
//! NDJSON response, matching the poll/subscribe duality
//! [`swap_node_core::watcher::EventWatcher`] already uses for the chain side.

use async_trait::async_trait;
use serde::Deserialize;
use swap_node_core::lightning::{
    Channel, ChannelsSnapshot, HoldInvoiceRequest, HoldInvoiceSubscription, InvoiceStatus, LnAdapter, LnPayment,
    LnPaymentClient, LnPaymentStatus,
};
use swap_node_core::{Error, Result};
use tokio::time::{sleep, Duration};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct LndRestAdapter {
    client: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
}

impl LndRestAdapter {
    pub fn new(base_url: String, macaroon_hex: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            macaroon_hex,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
    }

    async fn get_invoice_raw(&self, payment_hash: [u8; 32]) -> Result<LndInvoice> {
        let hex_hash = hex::encode(payment_hash);
        self.request(reqwest::Method::GET, &format!("/v1/invoice/{hex_hash}"))
            .send()
            .await
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)
    }
}

fn transient(e: reqwest::Error) -> Error {
    Error::Transient {
        collaborator: "lnd_rest",
        source: e.into(),
    }
}

#[derive(Debug, Deserialize)]
struct LndInvoice {
    state: String,
    expiry: String,
}

impl LndInvoice {
    fn status(&self, expires_at_unix: u64) -> InvoiceStatus {
        InvoiceStatus {
            is_held: self.state == "ACCEPTED",
            is_confirmed: self.state == "SETTLED",
            is_canceled: self.state == "CANCELED",
            expires_at_unix,
        }
    }
}

#[async_trait]
impl LnAdapter for LndRestAdapter {
    async fn create_hold_invoice(&self, request: HoldInvoiceRequest) -> Result<String> {
        #[derive(Deserialize)]
        struct CreateResp {
            payment_request: String,
        }

        let body = serde_json::json!({
            "memo": request.description,
            "hash": base64_encode(&request.payment_hash),
            "value_msat": request.mtokens.to_string(),
            "cltv_expiry": request.cltv_delta.to_string(),
            "expiry": (request.expires_at_unix).to_string(),
        });

        let resp: CreateResp = self
            .request(reqwest::Method::POST, "/v2/invoices/hold/create")
            .json(&body)
            .send()
            .await
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)?;
        Ok(resp.payment_request)
    }

    async fn subscribe(&self, payment_hash: [u8; 32]) -> Result<Box<dyn HoldInvoiceSubscription>> {
        Ok(Box::new(PollingSubscription {
            base_url: self.base_url.clone(),
            macaroon_hex: self.macaroon_hex.clone(),
            payment_hash,
        }))
    }

    async fn get_invoice(&self, payment_hash: [u8; 32]) -> Result<InvoiceStatus> {
        let raw = self.get_invoice_raw(payment_hash).await?;
        let expiry: u64 = raw.expiry.parse().unwrap_or(0);
        Ok(raw.status(expiry))
    }

    async fn cancel_hold_invoice(&self, payment_hash: [u8; 32]) -> Result<()> {
        let body = serde_json::json!({ "payment_hash": base64_encode(&payment_hash) });
        self.request(reqwest::Method::POST, "/v2/invoices/cancel")
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn settle_hold_invoice(&self, secret: [u8; 32]) -> Result<()> {
        let body = serde_json::json!({ "preimage": base64_encode(&secret) });
        self.request(reqwest::Method::POST, "/v2/invoices/settle")
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn channels_snapshot(&self, active_only: bool) -> Result<ChannelsSnapshot> {
        #[derive(Deserialize)]
        struct ChannelsResp {
            channels: Vec<LndChannel>,
        }
        #[derive(Deserialize)]
        struct LndChannel {
            active: bool,
            remote_balance: String,
        }

        let resp: ChannelsResp = self
            .request(reqwest::Method::GET, "/v1/channels")
            .send()
            .await
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)?;

        let channels = resp
            .channels
            .into_iter()
            .filter(|c| !active_only || c.active)
            .map(|c| Channel {
                active: c.active,
                remote_balance_msat: c.remote_balance.parse::<u64>().unwrap_or(0) * 1000,
            })
            .collect();
        Ok(ChannelsSnapshot::new(channels))
    }
}

struct PollingSubscription {
    base_url: String,
    macaroon_hex: String,
    payment_hash: [u8; 32],
}

#[async_trait]
impl HoldInvoiceSubscription for PollingSubscription {
    async fn wait_for_held(&mut self) -> Result<bool> {
        let adapter = LndRestAdapter::new(self.base_url.clone(), self.macaroon_hex.clone());
        loop {
            let status = adapter.get_invoice(self.payment_hash).await?;
            if status.is_held {
                return Ok(true);
            }
            if status.is_canceled {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Pays outbound BOLT-11 invoices via LND's REST `sendpayment` surface
/// (SPEC_FULL §4.F — the TO_BTC_LN direction's outbound complement).
pub struct LndPaymentClient {
    client: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
}

impl LndPaymentClient {
    pub fn new(base_url: String, macaroon_hex: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            macaroon_hex,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
    }
}

#[async_trait]
impl LnPaymentClient for LndPaymentClient {
    async fn pay_invoice(&self, bolt11: &str) -> Result<LnPayment> {
        let body = serde_json::json!({ "payment_request": bolt11, "timeout_seconds": 60 });
        self.request(reqwest::Method::POST, "/v1/channels/transactions")
            .json(&body)
            .send()
            .await
            .map_err(transient)?;
        Ok(LnPayment {
            tracking_id: bolt11.to_string(),
            preimage: None,
            status: LnPaymentStatus::InFlight,
        })
    }

    async fn payment_status(&self, tracking_id: &str) -> Result<LnPayment> {
        #[derive(Deserialize)]
        struct PaymentResp {
            status: String,
            payment_preimage: String,
        }

        let hash = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(tracking_id.as_bytes()))
        };
        let resp: PaymentResp = self
            .request(reqwest::Method::GET, &format!("/v2/router/track/{hash}"))
            .send()
            .await
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)?;

        let status = match resp.status.as_str() {
            "SUCCEEDED" => LnPaymentStatus::Succeeded,
            "FAILED" => LnPaymentStatus::Failed,
            _ => LnPaymentStatus::InFlight,
        };
        let preimage = hex::decode(&resp.payment_preimage)
            .ok()
            .and_then(|v| v.try_into().ok())
            .filter(|_| status == LnPaymentStatus::Succeeded);

        Ok(LnPayment {
            tracking_id: tracking_id.to_string(),
            preimage,
            status,
        })
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
