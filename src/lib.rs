pub mod assertion;
pub mod collab;
pub mod collab_endpoint;
pub mod collection_endpoint;
pub mod config;
pub mod definition;
pub mod environment_endpoint;
pub mod executor;
pub mod history;
pub mod method;
pub mod request_endpoint;
pub mod response;
pub mod serve;
pub mod state;
pub mod store;
pub mod variables;

pub use assertion::evaluate;
pub use serve::serve;
pub use variables::resolve;
