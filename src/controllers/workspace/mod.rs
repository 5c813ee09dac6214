pub mod controller;
pub(crate) mod reconcilers;
mod status;

pub use controller::run;
