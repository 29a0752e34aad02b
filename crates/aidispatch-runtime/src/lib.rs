//! AI Dispatch Runtime: dispatcher, media fetch, outcome delivery, fatal
//! handling.

pub mod dispatcher;
pub mod fatal;
pub mod fetch;
pub mod transport;
pub mod types;

pub use dispatcher::Dispatcher;
pub use fatal::FatalHandle;
pub use fetch::MediaFetcher;
pub use transport::{DeliveryBody, ResultTransport};
pub use types::*;
