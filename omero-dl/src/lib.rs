pub mod download;
pub mod explorer;
pub mod hierarchy;
pub mod highlight;
pub mod paths;
pub mod queue;
pub mod session;
pub mod settings;
