//! Billing error types

/// Errors produced by billing operations.
///
/// Processor declines on `charge`/`update_card` are deliberately *not*
/// errors; those surface as `Ok(None)`/`Ok(false)` so callers can treat a
/// decline as ordinary control flow. Everything structural (unknown plan,
/// rejected state change, transport failure) lands here.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The requested plan id does not exist at the payment gateway.
    #[error("plan '{0}' does not exist at the payment gateway")]
    PlanNotFound(String),

    /// The requested coupon id does not exist at the payment gateway.
    #[error("coupon '{0}' does not exist at the payment gateway")]
    CouponNotFound(String),

    /// The gateway rejected the subscription create call.
    #[error("subscription was not created: {0}")]
    SubscriptionNotCreated(String),

    /// The gateway rejected the subscription cancel call.
    #[error("subscription was not cancelled")]
    SubscriptionNotCancelled,

    /// The gateway rejected a plan change (same-cycle update or replacement).
    #[error("plan was not swapped")]
    PlanNotSwapped,

    /// The gateway rejected the discount update.
    #[error("coupon was not applied")]
    CouponNotApplied,

    /// No transaction (or owning subscription) exists for the given id.
    #[error("invoice '{0}' was not found")]
    InvoiceNotFound(String),

    /// The account has no gateway customer yet.
    #[error("account has no gateway customer")]
    NoCustomer,

    /// The operation cannot be expressed against the gateway's semantics.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Transport or protocol failure talking to the gateway.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Local persistence failure.
    #[error("database error: {0}")]
    Database(String),

    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type BillingResult<T> = Result<T, BillingError>;
