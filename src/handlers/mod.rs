pub mod admin_handlers;
pub mod health;
pub mod terminal_handlers;
