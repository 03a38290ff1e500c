pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{IdentityError, Result};
pub use types::{Fingerprint, Identity, OriginMethod};
