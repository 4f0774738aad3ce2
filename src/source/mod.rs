// Fetch transport abstraction; the HTTP client behind the workers.

pub mod http_source;
pub mod traits;
