
mod routes;
mod ws;

#[cfg(test)]
mod tests;

pub use routes::{router, AppState};
