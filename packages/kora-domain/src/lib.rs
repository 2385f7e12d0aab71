pub mod chat;
pub mod context;
pub mod event;
pub mod index;
pub mod search;
pub mod tokens;
