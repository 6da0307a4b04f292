pub mod log_format;
pub mod serde_hex;
