//! 1inch swap API client.
//!
//! Produces the calldata that converts seized collateral into the repayment
//! asset inside the liquidator contract. The client is stateless; every
//! request carries a 10 s timeout and is retried up to 3 times with a fixed
//! 10 s backoff before the caller sees an error.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

/// Swap API version the client speaks. [`MIN_RETURN_RANGE`] is only valid
/// for this version's router ABI.
pub const SWAP_API_VERSION: &str = "v6.0";

/// Byte range of the encoded `minReturn` argument inside the router swap
/// calldata: selector (4) + 6 words puts the seventh word at 196..228.
/// Tied to [`SWAP_API_VERSION`]; re-derive before bumping the version.
pub const MIN_RETURN_RANGE: std::ops::Range<usize> = 196..228;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Spacing between requests; the public tier rate-limits at 1 rps.
const REQUEST_SPACING: Duration = Duration::from_millis(1100);

/// Errors from the swap API layer.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("swap API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("swap API returned malformed payload: {0}")]
    Payload(String),
}

/// Swap transaction payload returned by the `/swap` endpoint. Only `data`
/// feeds the liquidation pipeline; the rest is kept for logging.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapTransaction {
    pub to: Address,
    pub data: Bytes,
    #[serde(default)]
    pub value: String,
    #[serde(default, rename = "gasPrice")]
    pub gas_price: String,
    #[serde(default)]
    pub gas: u64,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    tx: Option<SwapTransaction>,
}

/// Quote payload from the `/quote` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapQuote {
    #[serde(rename = "dstAmount")]
    pub dst_amount: String,
}

#[derive(Debug, Deserialize)]
struct SpenderResponse {
    address: Address,
}

/// Approval transaction payload from `/approve/transaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApproveTransaction {
    pub to: Address,
    pub data: Bytes,
    #[serde(default)]
    pub value: String,
}

/// Client for the 1inch swap API, scoped to one chain.
#[derive(Clone)]
pub struct SwapQuoteClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chain_id: u64,
}

impl std::fmt::Debug for SwapQuoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapQuoteClient")
            .field("base_url", &self.base_url)
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl SwapQuoteClient {
    pub fn new(api_key: impl Into<String>, chain_id: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: format!("https://api.1inch.dev/swap/{SWAP_API_VERSION}"),
            api_key: api_key.into(),
            chain_id,
        }
    }

    /// Override the base URL (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, SwapError> {
        let url = format!("{}/{}/{}", self.base_url, self.chain_id, path);

        let mut last_err = None;
        for attempt in 1..=MAX_RETRIES {
            tokio::time::sleep(REQUEST_SPACING).await;

            let result = self
                .client
                .get(&url)
                .bearer_auth(&self.api_key)
                .header("Accept", "application/json")
                .query(params)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(response) => return Ok(response.json::<T>().await?),
                Err(e) => {
                    warn!(
                        url,
                        attempt,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Swap API request failed, retrying after delay"
                    );
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        match last_err {
            Some(e) => Err(SwapError::Request(e)),
            None => Err(SwapError::Payload("request retries exhausted".into())),
        }
    }

    /// Fetch a quote for swapping `amount` of `src` into `dst`.
    pub async fn quote(
        &self,
        src: Address,
        dst: Address,
        amount: U256,
        slippage: f64,
        from: Address,
    ) -> Result<SwapQuote, SwapError> {
        let params = [
            ("src", format!("{src}")),
            ("dst", format!("{dst}")),
            ("amount", amount.to_string()),
            ("slippage", slippage.to_string()),
            ("from", format!("{from}")),
        ];
        self.get_json("quote", &params).await
    }

    /// Fetch a swap transaction whose calldata swaps `amount` of `src` into
    /// `dst`, delivering to `recipient`.
    ///
    /// `amount == 0` is a valid no-op in the external-liquidation case (the
    /// full debt was already repaid on the backing protocol); any other
    /// zero-amount call is a caller bug and is logged as such.
    pub async fn swap_transaction(
        &self,
        src: Address,
        dst: Address,
        amount: U256,
        externally_liquidated: bool,
        slippage: f64,
        recipient: Address,
    ) -> Result<Option<SwapTransaction>, SwapError> {
        if amount.is_zero() {
            if !externally_liquidated {
                error!(%src, %dst, "Zero swap amount outside external liquidation");
            }
            return Ok(None);
        }

        info!(
            %src,
            %dst,
            amount = %amount,
            slippage,
            %recipient,
            "Requesting swap transaction"
        );

        let params = [
            ("src", format!("{src}")),
            ("dst", format!("{dst}")),
            ("amount", amount.to_string()),
            ("slippage", slippage.to_string()),
            ("from", format!("{recipient}")),
            ("receiver", format!("{recipient}")),
            ("disableEstimate", "true".to_string()),
        ];

        let response: SwapResponse = self.get_json("swap", &params).await?;
        match response.tx {
            Some(tx) => Ok(Some(tx)),
            None => Err(SwapError::Payload("no tx field in swap response".into())),
        }
    }

    /// Router address that must be approved to spend the source token.
    pub async fn spender(&self) -> Result<Address, SwapError> {
        let response: SpenderResponse = self.get_json("approve/spender", &[]).await?;
        Ok(response.address)
    }

    /// Unlimited-allowance approval transaction for `token`.
    pub async fn approve_transaction(&self, token: Address) -> Result<ApproveTransaction, SwapError> {
        let params = [
            ("tokenAddress", format!("{token}")),
            ("amount", U256::MAX.to_string()),
        ];
        self.get_json("approve/transaction", &params).await
    }

    /// Slippage policy: external liquidations swap exactly the reward and
    /// tolerate none; everything else gets 1%.
    pub fn slippage_for(externally_liquidated: bool) -> f64 {
        if externally_liquidated {
            0.0
        } else {
            1.0
        }
    }
}

/// Decode the router's `minReturn` argument out of swap calldata.
/// Returns `None` when the calldata is too short to contain it.
pub fn decode_min_return(data: &[u8]) -> Option<U256> {
    if data.len() < MIN_RETURN_RANGE.end {
        return None;
    }
    Some(U256::from_be_slice(&data[MIN_RETURN_RANGE]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calldata_with_min_return(min_return: U256) -> Vec<u8> {
        let mut data = vec![0u8; MIN_RETURN_RANGE.end + 32];
        data[MIN_RETURN_RANGE].copy_from_slice(&min_return.to_be_bytes::<32>());
        data
    }

    #[test]
    fn min_return_roundtrip() {
        let expected = U256::from(123_456_789u64);
        let data = calldata_with_min_return(expected);
        assert_eq!(decode_min_return(&data), Some(expected));
    }

    #[test]
    fn min_return_rejects_short_calldata() {
        assert_eq!(decode_min_return(&[0u8; 64]), None);
        assert_eq!(decode_min_return(&[]), None);
    }

    #[test]
    fn slippage_policy() {
        assert_eq!(SwapQuoteClient::slippage_for(true), 0.0);
        assert_eq!(SwapQuoteClient::slippage_for(false), 1.0);
    }

    #[test]
    fn swap_response_parses() {
        let raw = r#"{
            "dstAmount": "995000",
            "tx": {
                "from": "0x1111111111111111111111111111111111111111",
                "to": "0x2222222222222222222222222222222222222222",
                "data": "0x0102",
                "value": "0",
                "gasPrice": "12000000",
                "gas": 250000
            }
        }"#;
        let parsed: SwapResponse = serde_json::from_str(raw).unwrap();
        let tx = parsed.tx.unwrap();
        assert_eq!(tx.to, "0x2222222222222222222222222222222222222222".parse::<Address>().unwrap());
        assert_eq!(tx.data.as_ref(), &[1u8, 2u8]);
        assert_eq!(tx.gas, 250000);
    }

    #[test]
    fn quote_response_parses() {
        let parsed: SwapQuote = serde_json::from_str(r#"{"dstAmount": "42"}"#).unwrap();
        assert_eq!(parsed.dst_amount, "42");
    }
}
