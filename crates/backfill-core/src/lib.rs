pub mod cluster;
pub mod config;
mod detach;
pub mod engine;
pub mod image;
pub mod metadata;
pub mod parent;
pub mod remote;
pub mod s3;

#[cfg(test)]
mod tests;
