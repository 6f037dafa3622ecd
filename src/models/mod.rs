//! Domain models: orders, their status vocabulary and the publication ledger.

pub mod order;
pub mod order_status;
pub mod publication_record;

pub use order::{validate_order_id, Order, OrderItem};
pub use order_status::{normalize_status, OrderStatus};
pub use publication_record::PublicationRecord;
