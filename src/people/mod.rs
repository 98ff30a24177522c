//! Person lifecycle: registration and removal.

pub mod service;

pub use service::{NewPersonRequest, PersonService, Registration};
