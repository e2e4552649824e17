//! Domain model (IDs, requests, records, states, payloads, errors).

pub mod constraints;
pub mod data;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod policy;
pub mod record;
pub mod request;
pub mod state;
pub mod status;

pub use constraints::Constraints;
pub use data::{Data, MAX_DATA_BYTES};
pub use errors::{EngineError, StoreError};
pub use ids::{Id, IdMarker, ParseIdError, Work, WorkId};
pub use outcome::{OutcomeKind, WorkResult};
pub use policy::{BackoffCriteria, BackoffPolicy, ExistingPeriodicWorkPolicy, ExistingWorkPolicy};
pub use record::WorkRecord;
pub use request::{DEFAULT_INPUT_MERGER, WorkRequest, WorkRequestBuilder};
pub use state::WorkState;
pub use status::WorkStatus;
