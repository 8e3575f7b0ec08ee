pub mod browser;
pub mod captcha;
pub mod course_cache;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod markup;
pub mod portal;
pub mod report;
pub mod semester;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;
