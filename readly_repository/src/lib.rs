pub mod api;

pub mod app_config;
pub mod books_repository;
pub mod telemetry;

#[cfg(test)]
mod test_support;
