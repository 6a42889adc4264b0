pub mod stream;
pub mod time;
pub mod version;
