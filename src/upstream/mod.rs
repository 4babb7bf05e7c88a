//! Backend API: mirror selection and account calls.

pub mod account;
pub mod resolver;

pub use account::{subscribe_url, AccountClient, SubscriptionInfo, UserInfo};
pub use resolver::{EndpointResolver, ResolverOptions};
