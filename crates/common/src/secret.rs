//! Secret types for protecting credentials from accidental logging.
//!
//! Login passwords and bearer tokens issued by the system under test are held
//! as [`SecretString`]. Its `Debug` implementation redacts the value, so any
//! struct deriving `Debug` that contains one (configuration, sessions) is safe
//! to hand to `tracing`.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let password = SecretString::from("test");
//! assert!(format!("{password:?}").contains("REDACTED"));
//! assert_eq!(password.expose_secret(), "test");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
