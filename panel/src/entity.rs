pub mod link;
pub mod setting;
pub mod template;
pub mod user;
