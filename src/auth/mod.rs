pub mod authorizor;
mod jwt;
mod platform;
mod user;

pub use jwt::{AuthValidator, Claims, JwtValidator};
pub use platform::Platform;
pub use user::{User, DRIVER_ROLE, SYSTEM_ROLE};
