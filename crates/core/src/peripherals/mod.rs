pub mod cache;
pub mod flash;

pub use cache::CacheController;
pub use flash::FlashController;
