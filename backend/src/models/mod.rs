pub mod image;
pub mod tag;
pub mod user;
