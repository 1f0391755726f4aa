//! Collaborator implementations: the Shopify Admin REST API and the
//! recovery persistence store (PostgREST or in-memory).

pub mod error;
pub mod memory;
pub mod rest_store;
pub mod shopify;

pub use error::{IntegrationError, IntegrationResult};
pub use memory::InMemoryStore;
pub use rest_store::PostgRestStore;
pub use shopify::ShopifyClient;
