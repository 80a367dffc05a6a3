//! Data models for beetlelog entities.
//!
//! - `Observation`, `NewObservation`, `ObservationUpdate`: Geotagged photo records
//! - `Inference`, `PredictPreview`: Species predictions from the classifier
//! - `ObservationSummary`, `SummaryFilters`: Aggregate reports
//! - Account payloads for registration and password reset

pub mod account;
pub mod observation;
pub mod report;

pub use account::{PasswordResetConfirm, PasswordResetRequest, Registration};
pub use observation::{
    Inference, InferenceSummary, ListParams, NewObservation, Observation, ObservationList,
    ObservationUpdate, Page, PhotoUpload, PredictPreview, SavedPrediction, ValidationAck,
};
pub use report::{AppliedFilters, DateCount, ObservationSummary, SpeciesCount, SummaryFilters};
