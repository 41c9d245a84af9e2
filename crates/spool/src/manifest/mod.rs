//! Discovery of the signed manifest URL from a rendered page.

pub mod cdp;
pub mod observer;
pub mod resolver;

pub use cdp::{ChromiumLauncher, ChromiumSession};
pub use observer::{BrowserLauncher, BrowserSession, TrafficObserver};
pub use resolver::{ManifestResolver, ResolverState, find_manifest_url};
