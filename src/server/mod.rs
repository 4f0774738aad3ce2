// HTTP surface: router, handlers and the server handle.

pub mod handler;
