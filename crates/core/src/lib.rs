pub mod commerce;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod store;
pub mod types;

pub use commerce::{CommerceApi, ProductCatalog};
pub use config::AppConfig;
pub use error::{RecoveryError, RecoveryResult};
pub use event_bus::{EventSink, RecoveryEvent, RecoveryEventType};
pub use store::RecoveryStore;
