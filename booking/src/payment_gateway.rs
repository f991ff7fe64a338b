//! Payment gateway seam.
//!
//! The booking core charges and refunds through [`PaymentGateway`]; card,
//! WeChat Pay and Alipay integrations live behind it. Group ticket orders are
//! prepaid and never reach the gateway.

use crate::types::{Money, PaymentMethod};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentGatewayError {
    /// Charge declined by the payer's bank or wallet
    Declined {
        /// Decline reason
        reason: String,
    },
    /// Payment method not supported by the gateway
    UnsupportedMethod(PaymentMethod),
    /// Gateway timeout
    Timeout,
    /// Refund refused
    RefundRejected {
        /// Gateway message
        reason: String,
    },
}

impl std::fmt::Display for PaymentGatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declined { reason } => write!(f, "Payment declined: {reason}"),
            Self::UnsupportedMethod(method) => write!(f, "Unsupported payment method: {method}"),
            Self::Timeout => write!(f, "Gateway timeout"),
            Self::RefundRejected { reason } => write!(f, "Refund rejected: {reason}"),
        }
    }
}

impl std::error::Error for PaymentGatewayError {}

/// A settled charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransaction {
    /// Gateway transaction ID
    pub transaction_id: String,
    /// Amount charged
    pub amount: Money,
    /// Payment method used
    pub payment_method: PaymentMethod,
}

/// Payment gateway trait
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount` for the purchase identified by `reference`
    ///
    /// # Errors
    ///
    /// Returns error if the charge does not go through
    fn charge(
        &self,
        reference: &str,
        amount: Money,
        payment_method: PaymentMethod,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<PaymentTransaction>> + Send>>;

    /// Return `amount` of a settled charge, yielding the refund reference
    ///
    /// # Errors
    ///
    /// Returns error if the refund fails
    fn refund(
        &self,
        transaction_id: &str,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<String>> + Send>>;
}

/// In-process gateway for development and tests
///
/// Approves every charge and refund unless told otherwise. Clones share
/// their switches and ledgers.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    decline: Arc<AtomicBool>,
    reject_refunds: Arc<AtomicBool>,
    charges: Arc<Mutex<Vec<PaymentTransaction>>>,
    refunds: Arc<Mutex<Vec<(String, Money)>>>,
}

impl MockPaymentGateway {
    /// Creates a gateway that approves everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Decline (or approve again) subsequent charges
    pub fn set_declining(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }

    /// Reject (or accept again) subsequent refunds
    pub fn set_rejecting_refunds(&self, reject: bool) {
        self.reject_refunds.store(reject, Ordering::SeqCst);
    }

    /// Charges approved so far
    #[must_use]
    pub fn charges(&self) -> Vec<PaymentTransaction> {
        self.charges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Refunds approved so far, as `(transaction_id, amount)`
    #[must_use]
    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.refunds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn charge(
        &self,
        reference: &str,
        amount: Money,
        payment_method: PaymentMethod,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<PaymentTransaction>> + Send>> {
        let reference = reference.to_string();
        let declined = self.decline.load(Ordering::SeqCst);
        let charges = Arc::clone(&self.charges);

        Box::pin(async move {
            if !payment_method.uses_gateway() {
                return Err(PaymentGatewayError::UnsupportedMethod(payment_method));
            }
            if declined {
                tracing::info!(%reference, amount = amount.cents(), "Mock payment declined");
                return Err(PaymentGatewayError::Declined {
                    reason: "declined by issuer".to_string(),
                });
            }

            let transaction = PaymentTransaction {
                transaction_id: format!("mock_txn_{}", uuid::Uuid::new_v4().simple()),
                amount,
                payment_method,
            };

            tracing::info!(
                %reference,
                amount = amount.cents(),
                transaction_id = %transaction.transaction_id,
                "Mock payment processed successfully"
            );

            charges
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(transaction.clone());
            Ok(transaction)
        })
    }

    fn refund(
        &self,
        transaction_id: &str,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<String>> + Send>> {
        let transaction_id = transaction_id.to_string();
        let rejected = self.reject_refunds.load(Ordering::SeqCst);
        let refunds = Arc::clone(&self.refunds);

        Box::pin(async move {
            if rejected {
                return Err(PaymentGatewayError::RefundRejected {
                    reason: "refund window closed at issuer".to_string(),
                });
            }

            let refund_id = format!("mock_refund_{}", uuid::Uuid::new_v4().simple());
            tracing::info!(
                %transaction_id,
                amount = amount.cents(),
                %refund_id,
                "Mock refund processed successfully"
            );

            refunds
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((transaction_id, amount));
            Ok(refund_id)
        })
    }
}
