//! Train Utils - Helpers around the training loop
//!
//! - [`PrimaryOnly`]: run work on the coordinating process only
//! - [`load_scalars_from_tfevents`] / [`EventWriter`]: scalar summaries in
//!   TensorBoard event files
//! - [`is_scalar`], [`opt_chain`], [`create_slice`]: small adapters

pub mod events;
pub mod gating;
pub mod optim;
pub mod scalar;
pub mod slice;

pub use events::{load_scalars_from_tfevents, EventWriter, ScalarLog};
pub use gating::PrimaryOnly;
pub use optim::opt_chain;
pub use scalar::is_scalar;
pub use slice::{create_slice, Slice};
