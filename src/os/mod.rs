pub mod fd;
pub mod mem;
