//! Application code served at startup: methods and publications.
//!
//! The method registry is shared with clients, which run the same bodies
//! as simulations.

pub mod todos;

use crate::publication::PublicationRegistry;
use lagless_engine::MethodRegistry;

/// Every method the server answers.
pub fn methods() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    todos::register_methods(&mut methods);
    methods
}

/// Every publication the server offers.
pub fn publications() -> PublicationRegistry {
    let mut publications = PublicationRegistry::new();
    todos::register_publications(&mut publications);
    publications
}
