pub mod abort;
pub mod get;
pub mod instances;
pub mod list;
pub mod progress;
pub mod rerun;
pub mod submit;
pub mod update;
