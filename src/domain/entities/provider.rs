use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// External system that owns a subscription lineage.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "subscription_provider", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Provider {
    /// Card-based recurring billing
    CardBilling,
    /// App store purchases relayed through an aggregator
    StoreAggregator,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::CardBilling, Provider::StoreAggregator];

    /// Path segment used by the inbound webhook routes.
    pub fn slug(&self) -> &'static str {
        match self {
            Provider::CardBilling => "card-billing",
            Provider::StoreAggregator => "store-aggregator",
        }
    }
}
