pub mod resolver;

pub use resolver::{PermissionsResolver, ResolutionError};
