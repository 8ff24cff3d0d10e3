//! Checkout adapter for Agenda.doc: issues hosted-checkout preferences and
//! reads back payment status from Mercado Pago.

pub mod config;
pub mod error;
pub mod logging;
pub mod psp;
pub mod retry;
pub mod watch;

pub use error::{CheckoutError, Result};
