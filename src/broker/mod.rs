mod client;

pub use client::{BrokerClient, HistoryBar};
