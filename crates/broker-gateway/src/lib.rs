pub mod client;
pub mod models;
pub mod testing;

pub use client::{BrokerApi, BrokerError, GatewayClient};
pub use models::{
    BrokerPosition, Funds, OrderAction, OrderStatus, OrderType, PlaceOrderRequest,
    PlaceOrderResponse, Quote,
};
