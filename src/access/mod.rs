pub mod controller;

pub use controller::AccessController;
