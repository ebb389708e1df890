mod auth;
mod handlers;
mod server;

pub use server::{run, ApiContext};
