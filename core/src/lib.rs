pub mod crypto;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{ErrorUtils, PkError, PkErrorKind, PkResult};
