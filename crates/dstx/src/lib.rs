//! 🚀 dstx: declarative destinations for event data.
//!
//! An event comes in, a mapping of `@`-directives reshapes it, a JSON Schema built from the
//! action's fields checks it, and the action's perform function ships it to the partner.
//!
//! ```text
//!   mapping ──▶ schema ──▶ action ──▶ destination
//!                              │
//!                       request_client
//! ```

pub mod action;
pub mod app_config;
pub mod destination;
pub mod errors;
pub mod mapping;
pub mod request_client;
pub mod schema;

pub use action::{Action, ActionDefinition, ActionResult, ExecuteInput, PerformOutput};
pub use destination::{Destination, DestinationDefinition, EventOptions, RawSettings};
pub use errors::ActionError;
pub use mapping::{transform, validate};
pub use request_client::{RequestClient, RequestOptions};
