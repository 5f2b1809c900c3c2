pub mod cancel;
pub mod delete;
pub mod filters;
pub mod list;
pub mod queue;
pub mod status;
pub mod tables;
pub mod test_storage;
