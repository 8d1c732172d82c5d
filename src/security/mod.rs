//! Bearer-token verification and the predicates that gate every
//! connection and administrative action.

pub mod claims;
pub mod key_cache;
pub mod predicates;

#[cfg(test)]
pub mod testing;

pub use claims::{extract_bearer, ClaimSettings, ClaimVerifier};
pub use key_cache::KeyCache;
pub use predicates::{
    missing_param, AuthorizationDecision, AuthorizationEngine, AuthorizedSubject, PathParams,
    Predicate,
};
