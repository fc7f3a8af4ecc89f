//! Identity state for vidloc
//!
//! The person registry maps every individual in the source footage to a
//! stable `person_id`; the identity generator turns each registered person
//! into a frozen replacement identity shared by every segment.

pub mod casting;
pub mod error;
pub mod registry;

pub use casting::{CastingConfig, IdentityGenerator, IdentitySet};
pub use error::{IdentityError, RegistryError};
pub use registry::{
    appearance_similarity, describe_position, FrameObservation, PersonRegistry, RegistryBuilder, RegistryConfig,
    SampledFrame,
};
