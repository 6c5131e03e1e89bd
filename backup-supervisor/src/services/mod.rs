pub mod components;
pub mod options_store;
pub mod retention;
