use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Brokerage or bank account, without balances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    /// Opaque key used by the balance and portfolio endpoints.
    pub account_id_key: String,
    pub account_mode: String,
    pub account_desc: String,
    pub account_name: Option<String>,
    pub account_type: String,
    pub institution_type: String,
    pub account_status: String,
    pub closed_date: Option<i64>,
    pub profile_index: u32,
    pub profile_label: String,
}

/// Cash and value figures for one account. Amounts are USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    pub account_type: String,
    pub account_description: Option<String>,
    pub account_mode: Option<String>,
    pub cash_balance: Option<Decimal>,
    pub cash_buying_power: Option<Decimal>,
    pub margin_buying_power: Option<Decimal>,
    pub total_account_value: Option<Decimal>,
    pub net_account_value: Option<Decimal>,
    pub uncleared_deposits: Option<Decimal>,
    pub funds_withheld_from_purchase_power: Option<Decimal>,
    pub funds_withheld_from_withdrawal: Option<Decimal>,
    pub profile_index: u32,
    pub profile_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub symbol_description: String,
    /// Security type such as `EQ`, `MF` or `OPTN`.
    pub type_code: String,
    pub quantity: Decimal,
    pub price_paid: Option<Decimal>,
    pub total_cost: Option<Decimal>,
    pub cost_per_share: Option<Decimal>,
    pub last_trade: Option<Decimal>,
    pub market_value: Option<Decimal>,
    pub total_gain: Option<Decimal>,
    pub total_gain_pct: Option<Decimal>,
    pub days_gain: Option<Decimal>,
    pub days_gain_pct: Option<Decimal>,
    pub position_type: Option<String>,
    pub quote_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub account_id: String,
    pub positions: Vec<Position>,
    /// Sum of position market values; absent when nothing is held.
    pub total_market_value: Option<Decimal>,
    pub profile_index: u32,
    pub profile_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub company_name: Option<String>,
    pub security_type: Option<String>,
    pub last_trade: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub change: Option<Decimal>,
    pub change_pct: Option<Decimal>,
    pub volume: Option<i64>,
    pub bid_size: Option<i64>,
    pub ask_size: Option<i64>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub open: Option<Decimal>,
    pub close: Option<Decimal>,
    pub high_52: Option<Decimal>,
    pub low_52: Option<Decimal>,
    pub pe_ratio: Option<Decimal>,
    pub dividend: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub quote_status: Option<String>,
    pub timestamp: Option<String>,
}
