//! Delivery time computation.

pub mod calculator;

pub use calculator::{
    delivery_instant_in_year, next_delivery_instant, DeliveryTime, DEFAULT_DELIVERY_HOUR,
};
