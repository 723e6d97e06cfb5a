pub mod resolver;

pub use resolver::{Discrepancy, IdentityResolver, MatchKey, Resolution, load_clients};
