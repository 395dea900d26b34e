use serde_json::Value;

use crate::api::{ApiError, ApiResult, EtradeClient};
use crate::auth::TokenStore;

use super::{decimal, field, integer, one_or_many, string, Quote};

/// Largest symbol batch the quote endpoint accepts.
pub const MAX_QUOTE_SYMBOLS: usize = 25;

pub struct QuoteService<S> {
    client: EtradeClient<S>,
}

impl<S> Clone for QuoteService<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<S> QuoteService<S>
where
    S: TokenStore,
{
    pub fn new(client: EtradeClient<S>) -> Self {
        Self { client }
    }

    /// Quotes for up to [`MAX_QUOTE_SYMBOLS`] symbols. No request is made for an empty list.
    pub async fn get_quotes<T>(&self, symbols: &[T]) -> ApiResult<Vec<Quote>>
    where
        T: AsRef<str>,
    {
        if symbols.len() > MAX_QUOTE_SYMBOLS {
            return Err(ApiError::InvalidArgument(format!(
                "at most {MAX_QUOTE_SYMBOLS} symbols allowed per request, got {}",
                symbols.len()
            )));
        }
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let mut cleaned = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let symbol = symbol.as_ref().trim();
            let valid = !symbol.is_empty()
                && symbol
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | ':'));
            if !valid {
                return Err(ApiError::InvalidArgument(format!(
                    "malformed symbol '{symbol}'"
                )));
            }
            cleaned.push(symbol.to_ascii_uppercase());
        }

        tracing::info!(count = cleaned.len(), "fetching quotes");
        let path = format!("/v1/market/quote/{}.json", cleaned.join(","));
        let data: Value = self.client.get_json(&path, &[]).await?;
        Ok(shape_quotes(&data))
    }
}

fn shape_quotes(data: &Value) -> Vec<Quote> {
    let empty = Value::Null;
    one_or_many(field(data, &["QuoteResponse", "QuoteData"]))
        .into_iter()
        .map(|raw| {
            let product = raw.get("Product").unwrap_or(&empty);
            let all = raw.get("All").unwrap_or(&empty);
            Quote {
                symbol: string(product, "symbol").unwrap_or_default(),
                company_name: string(product, "companyName"),
                security_type: string(product, "securityType"),
                last_trade: decimal(all, "lastTrade"),
                bid: decimal(all, "bid"),
                ask: decimal(all, "ask"),
                change: decimal(all, "change"),
                change_pct: decimal(all, "changePct"),
                volume: integer(all, "totalVolume"),
                bid_size: integer(all, "bidSize"),
                ask_size: integer(all, "askSize"),
                high: decimal(all, "high"),
                low: decimal(all, "low"),
                open: decimal(all, "open"),
                close: decimal(all, "previousClose"),
                high_52: decimal(all, "high52"),
                low_52: decimal(all, "low52"),
                pe_ratio: decimal(all, "peRatio"),
                dividend: decimal(all, "annualDividend"),
                dividend_yield: decimal(all, "dividendYield"),
                market_cap: decimal(all, "marketCap"),
                quote_status: string(all, "quoteStatus"),
                timestamp: string(all, "dateTime"),
            }
        })
        .collect()
}
