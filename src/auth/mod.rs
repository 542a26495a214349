//! Authentication & Security
//! Mission: JWT validation in front of every owner-scoped endpoint

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtHandler};
pub use middleware::{auth_middleware, AuthError};
