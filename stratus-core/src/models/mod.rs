pub mod billing;
pub mod cart;
pub mod catalog;
pub mod customer;
pub mod order;
pub mod webhook;

pub use billing::{
    CreditAdjustment, Gateway, GatewayWebhookLog, Invoice, InvoiceStatus, PaymentRequest,
    PaymentRequestStatus, PaymentSubscription, SubscriptionStatus, Transaction, TransactionStatus,
    TransactionType,
};
pub use cart::{Cart, CartItem, CartOwner, SelectedOption};
pub use catalog::{ConfigOption, ConfigSubOption, Coupon, DiscountType, Product, ProductPricing};
pub use customer::Customer;
pub use order::{Order, OrderItem, OrderStatus, Service, ServiceStatus};
pub use webhook::{DeliveryStatus, WebhookConfig, WebhookDelivery};

/// Status enums are persisted as lower-case text. This gives each one
/// `as_str`, `Display` and `FromStr` over the same name table.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::CoreError::StorageError(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use text_enum;
