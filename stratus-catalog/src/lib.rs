pub mod coupon;
pub mod pricing;

pub use coupon::{apply_coupon, item_discount, validate_coupon};
pub use pricing::{ItemQuote, OptionSelection, PricingEngine};
