//! Utils module - logging setup and small string helpers

pub mod logging;
pub mod string;

#[cfg(test)]
pub(crate) mod test_http;
