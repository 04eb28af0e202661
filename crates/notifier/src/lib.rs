pub mod adapter;
pub mod dispatcher;
pub mod frame;
pub mod live;
pub mod rate_limit;
pub mod registry;
pub mod webhook;
