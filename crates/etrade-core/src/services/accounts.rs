use rust_decimal::Decimal;
use serde_json::Value;

use crate::api::{ApiError, ApiResult, EtradeClient};
use crate::auth::TokenStore;

use super::{decimal, field, integer, one_or_many, string, Account, Balance, Portfolio, Position};

const CLOSED_STATUS: &str = "CLOSED";

/// Account listing, balances and holdings for one profile.
pub struct AccountService<S> {
    client: EtradeClient<S>,
}

impl<S> Clone for AccountService<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<S> AccountService<S>
where
    S: TokenStore,
{
    pub fn new(client: EtradeClient<S>) -> Self {
        Self { client }
    }

    /// Open accounts only; closed accounts are skipped.
    pub async fn list(&self) -> ApiResult<Vec<Account>> {
        tracing::info!(profile = self.client.profile().index(), "fetching account list");
        let data: Value = self.client.get_json("/v1/accounts/list.json", &[]).await?;
        let accounts = shape_accounts(&data, self.client.profile().index(), self.client.profile().label());
        tracing::info!(count = accounts.len(), "found active accounts");
        Ok(accounts)
    }

    pub async fn balance(&self, account_id_key: &str) -> ApiResult<Balance> {
        tracing::info!(account = account_id_key, "fetching balance");
        // The balance endpoint needs the institution type, which only the list carries.
        let account = self
            .list()
            .await?
            .into_iter()
            .find(|account| account.account_id_key == account_id_key)
            .ok_or_else(|| ApiError::AccountNotFound(account_id_key.to_owned()))?;

        let query = vec![
            ("instType".to_owned(), account.institution_type.clone()),
            ("realTimeNAV".to_owned(), "true".to_owned()),
        ];
        let path = format!("/v1/accounts/{}/balance.json", path_segment(account_id_key)?);
        let data: Value = self.client.get_json(&path, &query).await?;
        Ok(shape_balance(
            &data,
            self.client.profile().index(),
            self.client.profile().label(),
        ))
    }

    pub async fn portfolio(&self, account_id_key: &str) -> ApiResult<Portfolio> {
        tracing::info!(account = account_id_key, "fetching portfolio");
        let path = format!("/v1/accounts/{}/portfolio.json", path_segment(account_id_key)?);
        let data: Value = self.client.get_json(&path, &[]).await?;
        Ok(shape_portfolio(
            &data,
            account_id_key,
            self.client.profile().index(),
            self.client.profile().label(),
        ))
    }
}

fn path_segment(account_id_key: &str) -> ApiResult<&str> {
    let valid = !account_id_key.is_empty()
        && account_id_key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(account_id_key)
    } else {
        Err(ApiError::InvalidArgument(format!(
            "malformed account key '{account_id_key}'"
        )))
    }
}

fn shape_accounts(data: &Value, profile_index: u32, profile_label: &str) -> Vec<Account> {
    one_or_many(field(data, &["AccountListResponse", "Accounts", "Account"]))
        .into_iter()
        .filter(|raw| raw.get("accountStatus").and_then(Value::as_str) != Some(CLOSED_STATUS))
        .map(|raw| Account {
            account_id: string(raw, "accountId").unwrap_or_default(),
            account_id_key: string(raw, "accountIdKey").unwrap_or_default(),
            account_mode: string(raw, "accountMode").unwrap_or_default(),
            account_desc: string(raw, "accountDesc").unwrap_or_default(),
            account_name: string(raw, "accountName"),
            account_type: string(raw, "accountType").unwrap_or_default(),
            institution_type: string(raw, "institutionType").unwrap_or_default(),
            account_status: string(raw, "accountStatus").unwrap_or_default(),
            closed_date: integer(raw, "closedDate"),
            profile_index,
            profile_label: profile_label.to_owned(),
        })
        .collect()
}

fn shape_balance(data: &Value, profile_index: u32, profile_label: &str) -> Balance {
    let empty = Value::Null;
    let response = data.get("BalanceResponse").unwrap_or(&empty);
    let computed = response.get("Computed").unwrap_or(&empty);
    let realtime = computed.get("RealTimeValues").unwrap_or(&empty);

    Balance {
        account_id: string(response, "accountId").unwrap_or_default(),
        account_type: string(response, "accountType").unwrap_or_default(),
        account_description: string(response, "accountDescription"),
        account_mode: string(response, "accountMode"),
        cash_balance: decimal(computed, "cashBalance"),
        cash_buying_power: decimal(computed, "cashBuyingPower"),
        margin_buying_power: decimal(computed, "marginBuyingPower"),
        total_account_value: decimal(realtime, "totalAccountValue"),
        net_account_value: decimal(realtime, "netAccountValue"),
        uncleared_deposits: decimal(computed, "unclearedDeposits"),
        funds_withheld_from_purchase_power: decimal(computed, "fundsWithheldFromPurchasePower"),
        funds_withheld_from_withdrawal: decimal(computed, "fundsWithheldFromWithdrawal"),
        profile_index,
        profile_label: profile_label.to_owned(),
    }
}

fn shape_portfolio(
    data: &Value,
    account_id_key: &str,
    profile_index: u32,
    profile_label: &str,
) -> Portfolio {
    let empty = Value::Null;
    let positions: Vec<Position> =
        one_or_many(field(data, &["PortfolioResponse", "AccountPortfolio"]))
            .into_iter()
            .flat_map(|portfolio| one_or_many(portfolio.get("Position")))
            .map(|raw| {
                let quick = raw.get("Quick").unwrap_or(&empty);
                let description = string(raw, "symbolDescription").unwrap_or_default();
                Position {
                    symbol: description.clone(),
                    symbol_description: description,
                    type_code: field(raw, &["Product", "securityType"])
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    quantity: decimal(raw, "quantity").unwrap_or(Decimal::ZERO),
                    price_paid: decimal(raw, "pricePaid"),
                    total_cost: decimal(raw, "totalCost"),
                    cost_per_share: decimal(raw, "costPerShare"),
                    last_trade: decimal(quick, "lastTrade"),
                    market_value: decimal(raw, "marketValue"),
                    total_gain: decimal(raw, "totalGain"),
                    total_gain_pct: decimal(raw, "totalGainPct"),
                    days_gain: decimal(raw, "daysGain"),
                    days_gain_pct: decimal(raw, "daysGainPct"),
                    position_type: string(raw, "positionType"),
                    quote_detail: string(raw, "quoteDetail"),
                }
            })
            .collect();

    let total: Decimal = positions
        .iter()
        .filter_map(|position| position.market_value)
        .sum();

    Portfolio {
        account_id: account_id_key.to_owned(),
        positions,
        total_market_value: (total > Decimal::ZERO).then_some(total),
        profile_index,
        profile_label: profile_label.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::authorized_client;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::str::FromStr;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    fn account_list() -> Value {
        json!({
            "AccountListResponse": {
                "Accounts": {
                    "Account": [
                        {
                            "accountId": "84062719",
                            "accountIdKey": "abc123xyz",
                            "accountMode": "CASH",
                            "accountDesc": "Individual Brokerage",
                            "accountType": "INDIVIDUAL",
                            "institutionType": "BROKERAGE",
                            "accountStatus": "ACTIVE"
                        },
                        {
                            "accountId": "11112222",
                            "accountIdKey": "closedKey",
                            "accountMode": "CASH",
                            "accountDesc": "Old",
                            "accountType": "INDIVIDUAL",
                            "institutionType": "BROKERAGE",
                            "accountStatus": "CLOSED",
                            "closedDate": 1609459200
                        }
                    ]
                }
            }
        })
    }

    #[test]
    fn closed_accounts_are_skipped() {
        let accounts = shape_accounts(&account_list(), 1, "IRA");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id_key, "abc123xyz");
        assert_eq!(accounts[0].institution_type, "BROKERAGE");
        assert_eq!(accounts[0].profile_index, 1);
        assert_eq!(accounts[0].profile_label, "IRA");
    }

    #[test]
    fn single_account_object_is_accepted() {
        let data = json!({
            "AccountListResponse": {
                "Accounts": {
                    "Account": {
                        "accountId": "1",
                        "accountIdKey": "only",
                        "accountStatus": "ACTIVE"
                    }
                }
            }
        });
        let accounts = shape_accounts(&data, 0, "Profile 0");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_mode, "");
    }

    #[test]
    fn portfolio_flattens_nested_singletons() {
        let data = json!({
            "PortfolioResponse": {
                "AccountPortfolio": {
                    "Position": {
                        "symbolDescription": "APPLE INC COM",
                        "quantity": 10,
                        "marketValue": 1750.00,
                        "Product": { "securityType": "EQ" },
                        "Quick": { "lastTrade": 175.00 }
                    }
                }
            }
        });
        let portfolio = shape_portfolio(&data, "abc123xyz", 0, "Profile 0");
        assert_eq!(portfolio.account_id, "abc123xyz");
        assert_eq!(portfolio.positions.len(), 1);
        let position = &portfolio.positions[0];
        assert_eq!(position.type_code, "EQ");
        assert_eq!(position.quantity, dec("10"));
        assert_eq!(position.last_trade, Some(dec("175")));
        assert_eq!(portfolio.total_market_value, Some(dec("1750")));
    }

    #[test]
    fn portfolio_total_sums_positions_or_is_absent() {
        let data = json!({
            "PortfolioResponse": {
                "AccountPortfolio": [
                    { "Position": [
                        { "symbolDescription": "MSFT", "quantity": 5, "marketValue": 1900.10 },
                        { "symbolDescription": "CASH", "quantity": 1, "marketValue": "bad" }
                    ]},
                    { "Position": { "symbolDescription": "SPY", "quantity": 2, "marketValue": 1000 } }
                ]
            }
        });
        let portfolio = shape_portfolio(&data, "k", 0, "Profile 0");
        assert_eq!(portfolio.positions.len(), 3);
        assert_eq!(portfolio.positions[1].market_value, None);
        assert_eq!(portfolio.total_market_value, Some(dec("2900.10")));

        let empty = shape_portfolio(&json!({ "PortfolioResponse": {} }), "k", 0, "Profile 0");
        assert!(empty.positions.is_empty());
        assert_eq!(empty.total_market_value, None);
    }

    #[tokio::test]
    async fn balance_uses_institution_type_from_list() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/accounts/list.json");
                then.status(200).json_body(account_list());
            })
            .await;
        let balance = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/accounts/abc123xyz/balance.json")
                    .query_param("instType", "BROKERAGE")
                    .query_param("realTimeNAV", "true");
                then.status(200).json_body(json!({
                    "BalanceResponse": {
                        "accountId": "84062719",
                        "accountType": "INDIVIDUAL",
                        "accountDescription": "Individual Brokerage",
                        "Computed": {
                            "cashBalance": 1250.55,
                            "cashBuyingPower": "1250.55",
                            "marginBuyingPower": null,
                            "RealTimeValues": {
                                "totalAccountValue": 98123.45,
                                "netAccountValue": 98000
                            }
                        }
                    }
                }));
            })
            .await;

        let (client, _store) = authorized_client(&server.base_url());
        let service = AccountService::new(client);
        let result = service.balance("abc123xyz").await.unwrap();
        balance.assert_async().await;

        assert_eq!(result.account_id, "84062719");
        assert_eq!(result.cash_balance, Some(dec("1250.55")));
        assert_eq!(result.cash_buying_power, Some(dec("1250.55")));
        assert_eq!(result.margin_buying_power, None);
        assert_eq!(result.total_account_value, Some(dec("98123.45")));
        assert_eq!(result.net_account_value, Some(dec("98000")));
        assert_eq!(result.profile_label, "Primary");
    }

    #[tokio::test]
    async fn balance_for_unknown_account_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/accounts/list.json");
                then.status(200).json_body(account_list());
            })
            .await;

        let (client, _store) = authorized_client(&server.base_url());
        let err = AccountService::new(client)
            .balance("closedKey")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AccountNotFound(key) if key == "closedKey"));
    }

    #[tokio::test]
    async fn portfolio_rejects_malformed_keys() {
        let (client, _store) = authorized_client("http://127.0.0.1:9");
        let err = AccountService::new(client)
            .portfolio("../list")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }
}
