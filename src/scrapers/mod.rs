pub mod block;
pub mod browser;
pub mod captcha;
pub mod extract;
#[cfg(test)]
pub mod fake;
pub mod fingerprint;
pub mod html;
pub mod http;
pub mod resolution;
pub mod traits;
pub mod types;

pub use block::BlockDetector;
pub use browser::ChromeDriver;
pub use fingerprint::SessionFingerprint;
pub use http::HttpDriver;
pub use traits::PageDriver;
pub use types::ScrapePlan;
