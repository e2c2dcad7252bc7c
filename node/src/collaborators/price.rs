//! HTTP-backed price oracle (§1 "the price oracle" — an external
//! collaborator; the core only consumes [`swap_node_core::supervisor::PriceOracle`]).

use async_trait::async_trait;
use rust_decimal::prelude::*;
use serde::Deserialize;
use swap_node_core::supervisor::{PriceOracle, Quote};
use swap_node_core::{Error, Result};

#[derive(Debug, Deserialize)]
struct PriceResponse {
    /// Price in token-units per requested Bitcoin-side unit.
    price: f64,
}

pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
    swap_fee_bps: u64,
}

impl HttpPriceOracle {
    pub fn new(base_url: String, swap_fee_bps: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            swap_fee_bps,
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn quote(&self, token: &str, amount: u128, exact_out: bool) -> Result<Quote> {
        let resp: PriceResponse = self
            .client
            .get(format!("{}/price", self.base_url))
            .query(&[("token", token), ("exactOut", if exact_out { "true" } else { "false" })])
            .send()
            .await
            .map_err(|e| Error::Transient {
                collaborator: "price_oracle",
                source: e.into(),
            })?
            .json()
            .await
            .map_err(|e| Error::Transient {
                collaborator: "price_oracle",
                source: e.into(),
            })?;

        let price = Decimal::from_f64(resp.price).ok_or_else(|| Error::Terminal("price oracle returned NaN".to_string()))?;
        let amount_bd = amount;
        let token_amount = Decimal::from(amount_bd) * price;
        let fee_bps = Decimal::from(self.swap_fee_bps) / Decimal::from(10_000u64);
        let swap_fee = (Decimal::from(amount_bd) * fee_bps).round().to_u128().unwrap_or(0);
        let swap_fee_in_token = (token_amount * fee_bps).round().to_u128().unwrap_or(0);
        let total_in_token = (token_amount.round()).to_u128().unwrap_or(0) + swap_fee_in_token;

        Ok(Quote {
            amount_bd,
            swap_fee,
            swap_fee_in_token,
            total_in_token,
        })
    }
}
