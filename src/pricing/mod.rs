pub mod cost;
pub mod rates;

pub use self::cost::{CostBreakdown, CostCalculator};
pub use self::rates::{ModelPricing, RateSource, RateTable, Rates, ResolvedRate};
