pub mod chat;
pub mod history;
pub mod init;
pub mod render;
pub mod resume;
pub mod runtime;
pub mod sessions;
