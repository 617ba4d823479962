pub mod booking;
pub mod notifier;
pub mod reconciliation;
pub mod sweeper;

pub use booking::{BookingReceipt, BookingRequest, BookingService, SeatSelection};
pub use notifier::Notifier;
pub use reconciliation::{PaymentStatusView, Reconciler, SettleOutcome};
pub use sweeper::PaymentSweeper;
