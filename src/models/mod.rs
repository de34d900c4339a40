// Domain models
pub mod common;
pub mod product;
pub mod purchase;
pub mod receipt;
pub mod subscription;
