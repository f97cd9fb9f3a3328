//! HTTP request handlers for the Users and Items services.

pub mod items;
pub mod users;
