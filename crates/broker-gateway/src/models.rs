use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
        }
    }

    /// The opposite side, used for emergency covers.
    pub fn reversed(&self) -> OrderAction {
        match self {
            OrderAction::Buy => OrderAction::Sell,
            OrderAction::Sell => OrderAction::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: i32,
    pub order_type: OrderType,
    pub product: String,
    pub exchange: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl PlaceOrderRequest {
    pub fn limit(symbol: impl Into<String>, action: OrderAction, quantity: i32, exchange: &str, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            quantity,
            order_type: OrderType::Limit,
            product: "NRML".to_string(),
            exchange: exchange.to_string(),
            price: Some(price),
        }
    }

    pub fn market(symbol: impl Into<String>, action: OrderAction, quantity: i32, exchange: &str) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            quantity,
            order_type: OrderType::Market,
            product: "NRML".to_string(),
            exchange: exchange.to_string(),
            price: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub orderid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PlaceOrderResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// One orderbook row. Field availability varies by broker; the executor
/// falls back across `fill_price`/`price` and `filled_lots`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderStatus {
    #[serde(default)]
    pub orderid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub fill_status: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub avg_fill_price: Option<f64>,
    #[serde(default)]
    pub filled_lots: Option<i32>,
    #[serde(default)]
    pub remaining_lots: Option<i32>,
}

impl OrderStatus {
    pub fn is_complete(&self) -> bool {
        let status = self.status.to_uppercase();
        let fill = self.fill_status.as_deref().unwrap_or("").to_uppercase();
        matches!(status.as_str(), "COMPLETE" | "FILLED" | "TRADED") || fill == "COMPLETE"
    }

    pub fn is_partial(&self) -> bool {
        self.status.eq_ignore_ascii_case("PARTIAL")
            || self.fill_status.as_deref().is_some_and(|f| f.eq_ignore_ascii_case("PARTIAL"))
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self.status.to_uppercase().as_str(), "REJECTED" | "CANCELLED" | "CANCELED")
    }

    pub fn effective_fill_price(&self) -> Option<f64> {
        self.fill_price.or(self.avg_fill_price).or(self.price)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Quote {
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
}

impl Quote {
    /// Mid price when both sides quote, otherwise last traded price.
    pub fn mid(&self) -> Option<f64> {
        if self.bid > 0.0 && self.ask > 0.0 {
            Some((self.bid + self.ask) / 2.0)
        } else if self.ltp > 0.0 {
            Some(self.ltp)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Funds {
    #[serde(default)]
    pub availablecash: f64,
    #[serde(default)]
    pub collateral: f64,
    #[serde(default)]
    pub utiliseddebits: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    #[serde(default)]
    pub quantity: i32,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub average_price: Option<f64>,
}
