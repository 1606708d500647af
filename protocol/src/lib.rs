mod ids;
pub use ids::InstanceId;
pub use ids::RequestIdGen;
pub use ids::new_session_id;
pub mod decision;
pub mod envelope;
pub mod feed;
pub mod hook;
pub mod session;
pub mod tokens;
