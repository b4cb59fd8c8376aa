pub mod error;
pub mod image_spec;
pub mod object;
